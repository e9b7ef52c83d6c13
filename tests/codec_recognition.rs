//! Frame recognition properties of the codec, driven over a memory channel.
//!
//! These pin down the behaviors the rest of the driver leans on: idle
//! polling is free of side effects, CR LF always delimits a response, the
//! repeat-hash heuristic bounds how long ambiguous bytes are held, error
//! markers are reported exactly once each, and garbage input is dropped
//! wholesale.

use cbus_pci::{
    CBusOptions,
    MemoryChannel,
    MessageCodec,
    codec::DEFAULT_GIVE_UP_THRESHOLD,
    wire::{CBusMessage, Reply, Request},
};
use rstest::rstest;

fn new_codec() -> (MessageCodec<MemoryChannel>, cbus_pci::MemoryHandle) {
    let (channel, handle) = MemoryChannel::new();
    (MessageCodec::new(channel, CBusOptions::NEUTRAL), handle)
}

#[tokio::test]
async fn idle_polling_is_idempotent() {
    let (mut codec, _handle) = new_codec();
    for _ in 0..50 {
        assert!(codec.receive().await.unwrap().is_none());
    }
}

#[rstest]
#[case::confirmation(b"g.\r\n".as_slice())]
#[case::confirmation_with_reply(b"h.86040200E440380001\r\n".as_slice())]
#[case::power_up(b"+\r\n".as_slice())]
#[tokio::test]
async fn crlf_always_delimits_one_response(#[case] frame: &[u8]) {
    let (mut codec, handle) = new_codec();
    handle.feed(frame);
    let message = codec.receive().await.unwrap();
    assert!(matches!(message, Some(CBusMessage::ToClient(_))));
    // The whole frame, terminator included, must be consumed.
    assert!(codec.receive().await.unwrap().is_none());
}

#[rstest]
#[case::trailing_junk(b"what on earth\n".as_slice())]
#[case::lf_only(b"\n".as_slice())]
#[tokio::test]
async fn lf_without_cr_is_discarded_with_nothing_left(#[case] garbage: &[u8]) {
    let (mut codec, handle) = new_codec();
    handle.feed(garbage);
    assert!(codec.receive().await.unwrap().is_none());
    let (mut fresh, fresh_handle) = new_codec();
    // The stream is resynchronized: a following valid frame parses.
    fresh_handle.feed(garbage);
    fresh.receive().await.unwrap();
    fresh_handle.feed(b"g.\r\n");
    assert!(fresh.receive().await.unwrap().is_some());
}

#[tokio::test]
async fn unterminated_buffer_commits_only_after_threshold() {
    let (mut codec, handle) = new_codec();
    handle.feed(b"i.");
    for poll in 0..DEFAULT_GIVE_UP_THRESHOLD {
        assert!(
            codec.receive().await.unwrap().is_none(),
            "committed too early at poll {poll}"
        );
    }
    assert!(codec.receive().await.unwrap().is_some());
}

#[tokio::test]
async fn single_marker_yields_single_error_reply() {
    let (mut codec, handle) = new_codec();
    // A complete request frame with one marker spliced in, plus a trailing
    // byte so the recognizer commits to the CR.
    handle.feed(b"~~~!\rX");
    assert_eq!(
        codec.receive().await.unwrap(),
        Some(CBusMessage::ToClient(Reply::ServerError))
    );
    // Subsequent polls surface the frame, not more synthetic errors.
    assert_eq!(
        codec.receive().await.unwrap(),
        Some(CBusMessage::ToServer(Request::Reset))
    );
    assert!(codec.receive().await.unwrap().is_none());
}

#[tokio::test]
async fn burst_of_markers_reports_one_per_poll() {
    let (mut codec, handle) = new_codec();
    handle.feed(b"~~~!!!\rX");
    for _ in 0..3 {
        assert_eq!(
            codec.receive().await.unwrap(),
            Some(CBusMessage::ToClient(Reply::ServerError))
        );
    }
    assert_eq!(
        codec.receive().await.unwrap(),
        Some(CBusMessage::ToServer(Request::Reset))
    );
}

#[tokio::test]
async fn leading_marker_needs_no_terminator() {
    let (mut codec, handle) = new_codec();
    handle.feed(b"!");
    assert_eq!(
        codec.receive().await.unwrap(),
        Some(CBusMessage::ToClient(Reply::ServerError))
    );
    assert!(codec.receive().await.unwrap().is_none());
}

#[tokio::test]
async fn second_cr_reclassifies_pending_bytes_as_request() {
    let (mut codec, handle) = new_codec();
    // Two back-to-back PCI frames: the second CR proves the first frame is
    // complete without waiting for any LF.
    handle.feed(b"~~~\r~~~\r");
    assert_eq!(
        codec.receive().await.unwrap(),
        Some(CBusMessage::ToServer(Request::Reset))
    );
}
