//! Marshalling collaborator contract.
//!
//! The engine never interprets object bytes itself. A [`Marshaller`] frames
//! objects onto byte sequences and recovers them from byte inputs; what an
//! object means is the business of the layers above. Decoders must be
//! self-delimiting, because multi-frame payloads carry no end-of-object
//! marker on the wire.

use bytes::{Buf, BufMut, Bytes};
use tokio::io::AsyncReadExt;

use crate::byte_input::ByteSource;
use crate::error::MarshalError;
use crate::protocol::{put_string_z, take_string_z};
use crate::service::BoxFuture;

/// Ordered string-to-string options attached to a service open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionMap {
    entries: Vec<(String, String)>,
}

impl OptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One marshalling context. Factories hand out a fresh one per use.
pub trait Marshaller: Send + Sync {
    /// Decode the option map trailing a service-open request.
    fn read_options(&self, bytes: Bytes) -> Result<OptionMap, MarshalError>;

    /// Encode an option map.
    fn write_options(&self, options: &OptionMap, out: &mut Vec<u8>) -> Result<(), MarshalError>;

    /// Decode exactly one object from a byte input, suspending while bytes
    /// are still in flight.
    fn read_object<'a>(
        &'a self,
        source: &'a mut ByteSource,
    ) -> BoxFuture<'a, Result<Bytes, MarshalError>>;

    /// Encode one object.
    fn write_object(&self, object: &[u8], out: &mut Vec<u8>) -> Result<(), MarshalError>;
}

/// Produces marshallers for the engine. Implementations decide the actual
/// object encoding.
pub trait MarshallerFactory: Send + Sync {
    fn marshaller(&self) -> Box<dyn Marshaller>;
}

/// Reference marshalling.
///
/// Objects are framed with a big-endian u32 length prefix; option maps are a
/// u16 pair count followed by NUL-terminated key/value strings. Real
/// deployments plug in their own object encoding; this one exists so tests
/// and in-process links have something concrete.
pub struct PrefixMarshalling;

impl MarshallerFactory for PrefixMarshalling {
    fn marshaller(&self) -> Box<dyn Marshaller> {
        Box::new(PrefixMarshaller)
    }
}

struct PrefixMarshaller;

impl Marshaller for PrefixMarshaller {
    fn read_options(&self, mut bytes: Bytes) -> Result<OptionMap, MarshalError> {
        if bytes.remaining() < 2 {
            return Err(MarshalError::Corrupt("option map header truncated".into()));
        }
        let count = bytes.get_u16();
        let mut options = OptionMap::new();
        for _ in 0..count {
            let key =
                take_string_z(&mut bytes).map_err(|e| MarshalError::Corrupt(e.to_string()))?;
            let value =
                take_string_z(&mut bytes).map_err(|e| MarshalError::Corrupt(e.to_string()))?;
            options.insert(key, value);
        }
        Ok(options)
    }

    fn write_options(&self, options: &OptionMap, out: &mut Vec<u8>) -> Result<(), MarshalError> {
        let count = u16::try_from(options.len())
            .map_err(|_| MarshalError::Corrupt("too many options".into()))?;
        out.put_u16(count);
        for (key, value) in options.iter() {
            put_string_z(out, key);
            put_string_z(out, value);
        }
        Ok(())
    }

    fn read_object<'a>(
        &'a self,
        source: &'a mut ByteSource,
    ) -> BoxFuture<'a, Result<Bytes, MarshalError>> {
        Box::pin(async move {
            let len = source.read_u32().await.map_err(MarshalError::from)? as usize;
            let mut data = vec![0u8; len];
            source.read_exact(&mut data).await.map_err(MarshalError::from)?;
            Ok(Bytes::from(data))
        })
    }

    fn write_object(&self, object: &[u8], out: &mut Vec<u8>) -> Result<(), MarshalError> {
        let len = u32::try_from(object.len())
            .map_err(|_| MarshalError::Corrupt("object too large".into()))?;
        out.put_u32(len);
        out.extend_from_slice(object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::byte_input::{NoopHandler, byte_input};

    use super::*;

    #[test]
    fn option_map_round_trip() {
        let marshaller = PrefixMarshalling.marshaller();
        let mut options = OptionMap::new();
        options.insert("mode", "fast");
        options.insert("label", "a\0b");

        let mut encoded = Vec::new();
        marshaller.write_options(&options, &mut encoded).unwrap();
        let decoded = marshaller.read_options(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded, options);
        assert_eq!(decoded.get("mode"), Some("fast"));
    }

    #[test]
    fn empty_option_map_is_two_bytes() {
        let marshaller = PrefixMarshalling.marshaller();
        let mut encoded = Vec::new();
        marshaller.write_options(&OptionMap::new(), &mut encoded).unwrap();
        assert_eq!(encoded, vec![0, 0]);
    }

    #[test]
    fn truncated_option_map_is_corrupt() {
        let marshaller = PrefixMarshalling.marshaller();
        assert!(marshaller.read_options(Bytes::from_static(&[0])).is_err());
        assert!(
            marshaller
                .read_options(Bytes::from_static(&[0, 1, b'k']))
                .is_err()
        );
    }

    #[tokio::test]
    async fn object_round_trip_across_chunks() {
        let marshaller = PrefixMarshalling.marshaller();
        let mut encoded = Vec::new();
        marshaller.write_object(b"payload", &mut encoded).unwrap();

        let (sink, mut source) = byte_input(Arc::new(NoopHandler));
        let (head, tail) = encoded.split_at(5);
        sink.push(Bytes::copy_from_slice(head));
        sink.push(Bytes::copy_from_slice(tail));

        let object = marshaller.read_object(&mut source).await.unwrap();
        assert_eq!(&object[..], b"payload");
    }
}
