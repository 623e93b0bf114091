//! Inbound and outbound stream plumbing: data, terminators, acks, signals.

mod support;

use std::io::ErrorKind;

use goshawk_core::cmd;
use support::*;
use tokio::io::AsyncReadExt;

fn stream_data(sid: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![cmd::STREAM_DATA];
    body.extend_from_slice(&sid.to_be_bytes());
    body.extend_from_slice(payload);
    body
}

fn id_frame(command: u8, id: u32) -> Vec<u8> {
    let mut body = vec![command];
    body.extend_from_slice(&id.to_be_bytes());
    body
}

#[tokio::test]
async fn inbound_stream_delivers_chunks_then_eof() {
    let (session, peer) = plain_session(no_services());
    let mut source = session.register_inbound_stream(5);
    assert_eq!(session.inbound_stream_ids(), vec![5]);

    dispatch(&session, &stream_data(5, b"he")).await;
    dispatch(&session, &stream_data(5, b"llo")).await;
    dispatch(&session, &id_frame(cmd::STREAM_CLOSE, 5)).await;

    let mut out = Vec::new();
    source.read_to_end(&mut out).await.expect("read");
    assert_eq!(out, b"hello");

    // One stream ack per drained chunk.
    for _ in 0..2 {
        let ack = peer_recv(&peer).await;
        assert_eq!(&ack[..], &id_frame(cmd::STREAM_ACK, 5)[..]);
    }
    assert_no_frame(&peer).await;
    assert!(session.inbound_stream_ids().is_empty());
}

#[tokio::test]
async fn inbound_stream_exception_breaks_the_reader() {
    let (session, _peer) = plain_session(no_services());
    let mut source = session.register_inbound_stream(5);

    dispatch(&session, &stream_data(5, b"xx")).await;
    dispatch(&session, &id_frame(cmd::STREAM_EXCEPTION, 5)).await;

    let mut out = [0u8; 8];
    source.read_exact(&mut out).await.expect_err("broken stream");
    assert!(session.inbound_stream_ids().is_empty());

    // The break is sticky.
    let err = source.read(&mut out).await.expect_err("still broken");
    assert_eq!(err.kind(), ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn outbound_stream_chunks_acks_and_close() {
    let (session, peer) = plain_session(no_services());
    let stream = session.open_outbound_stream();
    let sid = stream.id();
    assert_eq!(session.outbound_stream_ids(), vec![sid]);

    session
        .send_stream_data(&stream, b"abc")
        .await
        .expect("send");
    let frame = peer_recv(&peer).await;
    assert_eq!(frame[0], cmd::STREAM_DATA);
    assert_eq!(&frame[1..5], &sid.to_be_bytes());
    assert_eq!(&frame[5..], b"abc");

    dispatch(&session, &id_frame(cmd::STREAM_ACK, sid)).await;
    assert_eq!(session.stream_ack_count(sid), Some(1));
    assert_eq!(stream.acks().acked(), 1);

    session.finish_stream(&stream).await.expect("close");
    let frame = peer_recv(&peer).await;
    assert_eq!(&frame[..], &id_frame(cmd::STREAM_CLOSE, sid)[..]);
    assert!(session.outbound_stream_ids().is_empty());
}

#[tokio::test]
async fn outbound_stream_failure_sends_exception() {
    let (session, peer) = plain_session(no_services());
    let stream = session.open_outbound_stream();

    session.fail_stream(&stream).await.expect("fail");
    let frame = peer_recv(&peer).await;
    assert_eq!(&frame[..], &id_frame(cmd::STREAM_EXCEPTION, stream.id())[..]);
    assert!(session.outbound_stream_ids().is_empty());
}

#[tokio::test]
async fn peer_signals_set_sticky_flags() {
    let (session, _peer) = plain_session(no_services());
    let stream = session.open_outbound_stream();
    let sid = stream.id();

    assert!(!stream.is_async_start());
    dispatch(&session, &id_frame(cmd::STREAM_ASYNC_START, sid)).await;
    assert!(stream.is_async_start());

    dispatch(&session, &id_frame(cmd::STREAM_ASYNC_CLOSE, sid)).await;
    assert!(stream.is_async_close());

    dispatch(&session, &id_frame(cmd::STREAM_ASYNC_EXCEPTION, sid)).await;
    assert!(stream.is_async_exception());
}

#[tokio::test]
async fn local_signals_reach_the_wire() {
    use goshawk_core::StreamSignal;

    let (session, peer) = plain_session(no_services());
    for (signal, command) in [
        (StreamSignal::Start, cmd::STREAM_ASYNC_START),
        (StreamSignal::Close, cmd::STREAM_ASYNC_CLOSE),
        (StreamSignal::Exception, cmd::STREAM_ASYNC_EXCEPTION),
    ] {
        session.send_stream_signal(9, signal).await.expect("send");
        let frame = peer_recv(&peer).await;
        assert_eq!(&frame[..], &id_frame(command, 9)[..]);
    }
}
