//! goshawk-core: frame demultiplexer and protocol state engine for a
//! point-to-point RPC link.
//!
//! Two endpoints exchange length-prefixed binary frames over a reliable,
//! ordered byte stream. Each frame carries a command byte and mutates one of
//! several per-connection registries: clients opened across the link,
//! requests in flight in each direction, and byte streams in each direction.
//!
//! This crate defines:
//! - The per-connection engine ([`Session`]) with its demux loop and frame
//!   dispatcher
//! - Per-id entities and their registries ([`OutboundClient`],
//!   [`InboundRequest`], ...)
//! - Push-driven chunked byte inputs bridging the dispatcher and worker
//!   tasks ([`ByteSink`], [`ByteSource`])
//! - Wire constants and parsing primitives ([`cmd`], [`MsgFlags`])
//! - Collaborator contracts for transports, services and marshalling
//!   ([`Transport`], [`ServiceRegistry`], [`MarshallerFactory`])
//! - Pooled send buffers ([`BufferPool`], [`PooledBuf`])

#![forbid(unsafe_op_in_unsafe_fn)]

mod buffer_pool;
mod byte_input;
mod entity;
mod error;
mod marshal;
mod protocol;
mod registry;
mod service;
mod session;
mod transport;

pub use buffer_pool::*;
pub use byte_input::*;
pub use entity::*;
pub use error::*;
pub use marshal::*;
pub use protocol::*;
pub use registry::*;
pub use service::*;
pub use session::*;
pub use transport::*;
