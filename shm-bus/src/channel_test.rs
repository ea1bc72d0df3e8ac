use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::control::{Command, ControlKind, ControlQueue, RedactionMode};
use crate::detection::{BoundingBox, DetectionChannel};
use crate::error::BusError;
use crate::format::{FrameFormat, FrameFormatChannel, PixelLayout};
use crate::frame::{Frame, FrameChannel};
use crate::names::Namespace;
use crate::rendezvous::Rendezvous;

static SEQ: AtomicU32 = AtomicU32::new(0);

/// Per-test unique shm object name; runs never collide on the global
/// IPC namespace.
pub(crate) fn unique_name(tag: &str) -> String {
    format!(
        "/sbt-{}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed),
        tag
    )
}

fn unique_ns(tag: &str) -> Namespace {
    Namespace::new(&format!(
        "sbt{}n{}{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed),
        tag
    ))
}

#[test]
fn format_channel_publishes_exactly_once() {
    let ns = unique_ns("fmt");
    FrameFormatChannel::force_remove(&ns);
    let mut ch = FrameFormatChannel::create(&ns).unwrap();

    let format = FrameFormat::new(480, 640, PixelLayout::Rgb8);
    ch.publish(&format).unwrap();
    assert_eq!(FrameFormatChannel::open(&ns).unwrap().read().unwrap(), format);

    // immutable after first write
    assert!(matches!(
        ch.publish(&FrameFormat::new(1, 1, PixelLayout::Gray8)),
        Err(BusError::AlreadyExists { .. })
    ));
    ch.unlink();
}

#[test]
fn frame_channel_round_trips_and_enforces_format() {
    let ns = unique_ns("frm");
    FrameChannel::force_remove(&ns);
    let format = FrameFormat::new(4, 4, PixelLayout::Gray8);
    let mut ch = FrameChannel::create(&ns, format).unwrap();

    assert!(ch.latest().unwrap().is_none());

    let frame = Frame::new(12345, Bytes::from(vec![7u8; format.frame_len()]));
    ch.publish(&frame).unwrap();
    let reader = FrameChannel::open(&ns, format).unwrap();
    assert_eq!(reader.latest().unwrap().unwrap(), frame);

    // a frame of any other size is a contract breach, not a resize
    let wrong = Frame::new(12346, Bytes::from(vec![7u8; format.frame_len() + 1]));
    match ch.publish(&wrong) {
        Err(BusError::SizeMismatch { expected, got }) => {
            assert_eq!(expected, format.frame_len());
            assert_eq!(got, format.frame_len() + 1);
        }
        other => panic!("expected SizeMismatch, got {:?}", other),
    }
    // the rejected write left the previous frame intact
    assert_eq!(reader.latest().unwrap().unwrap(), frame);
    ch.unlink();
}

#[test]
fn control_queue_is_fifo_and_consumes_exactly_once() {
    let ns = unique_ns("ctl");
    ControlQueue::force_remove(&ns, ControlKind::FrameRateLimit);
    let sender = ControlQueue::create(&ns, ControlKind::FrameRateLimit).unwrap();
    let listener = ControlQueue::open(&ns, ControlKind::FrameRateLimit).unwrap();

    for fps in [10, 20, 30] {
        sender.send(Command::SetFrameRateLimit(fps)).unwrap();
    }
    for fps in [10, 20, 30] {
        assert_eq!(listener.recv().unwrap(), Command::SetFrameRateLimit(fps));
    }

    // nothing duplicated: the next message through is the sentinel
    sender.send(Command::SetFrameRateLimit(99)).unwrap();
    assert_eq!(listener.recv().unwrap(), Command::SetFrameRateLimit(99));

    ControlQueue::force_remove(&ns, ControlKind::FrameRateLimit);
}

#[test]
fn full_control_queue_reports_instead_of_blocking() {
    let ns = unique_ns("full");
    ControlQueue::force_remove(&ns, ControlKind::RedactionMode);
    let sender = ControlQueue::create(&ns, ControlKind::RedactionMode).unwrap();

    for _ in 0..10 {
        sender
            .send(Command::SetRedactionMode(RedactionMode::Blur))
            .unwrap();
    }
    assert!(matches!(
        sender.send(Command::SetRedactionMode(RedactionMode::Fill)),
        Err(BusError::QueueFull)
    ));
    ControlQueue::force_remove(&ns, ControlKind::RedactionMode);
}

#[test]
fn malformed_control_message_is_an_error_not_a_command() {
    let ns = unique_ns("bad");
    ControlQueue::force_remove(&ns, ControlKind::FrameRateLimit);
    let sender = ControlQueue::create(&ns, ControlKind::FrameRateLimit).unwrap();
    let listener = ControlQueue::open(&ns, ControlKind::FrameRateLimit).unwrap();

    // a zero fps is representable on the wire but not in the model
    sender.send(Command::SetFrameRateLimit(0)).unwrap();
    assert!(matches!(listener.recv(), Err(BusError::Malformed(_))));

    // mismatched command/queue pairs are refused before sending
    assert!(matches!(
        sender.send(Command::SetRedactionMode(RedactionMode::Fill)),
        Err(BusError::Malformed(_))
    ));
    ControlQueue::force_remove(&ns, ControlKind::FrameRateLimit);
}

#[test]
fn readiness_handshake_times_out_then_succeeds() {
    let ns = unique_ns("rdy");
    Rendezvous::force_remove(&ns, crate::names::READY);
    let ready = Rendezvous::create(&ns, crate::names::READY, crate::rendezvous::READY_DEPTH).unwrap();

    assert!(matches!(
        ready.wait_timeout(Duration::from_millis(30)),
        Err(BusError::Os(nix::errno::Errno::ETIMEDOUT))
    ));

    let ns_clone = ns.clone();
    let signaller = std::thread::spawn(move || {
        Rendezvous::open(&ns_clone, crate::names::READY)
            .unwrap()
            .signal()
            .unwrap();
    });
    ready.wait_timeout(Duration::from_secs(2)).unwrap();
    signaller.join().unwrap();
    Rendezvous::force_remove(&ns, crate::names::READY);
}

/// Detector publishes, signals, then waits for the renderer's ack; the
/// renderer must therefore observe every result exactly once and in
/// publication order.
#[test]
fn rendezvous_orders_detector_and_renderer() {
    const ROUNDS: i32 = 5;
    const ACK: &str = "ack";

    let ns = unique_ns("sync");
    DetectionChannel::force_remove(&ns);
    Rendezvous::force_remove(&ns, crate::names::DETECT_RENDER_SYNC);
    Rendezvous::force_remove(&ns, ACK);

    let mut detections = DetectionChannel::create(&ns).unwrap();
    let _sync_owner =
        Rendezvous::create(&ns, crate::names::DETECT_RENDER_SYNC, crate::rendezvous::SYNC_DEPTH)
            .unwrap();
    let _ack_owner = Rendezvous::create(&ns, ACK, crate::rendezvous::SYNC_DEPTH).unwrap();

    let producer_ns = ns.clone();
    let producer = std::thread::spawn(move || {
        let sync = Rendezvous::open(&producer_ns, crate::names::DETECT_RENDER_SYNC).unwrap();
        let ack = Rendezvous::open(&producer_ns, ACK).unwrap();
        for i in 0..ROUNDS {
            detections
                .publish(&[BoundingBox::new(i, 0, 10, 10)])
                .unwrap();
            // signal only after the write is visible
            sync.signal().unwrap();
            ack.wait().unwrap();
        }
    });

    let consumer_ns = ns.clone();
    let consumer = std::thread::spawn(move || {
        let detections = DetectionChannel::open(&consumer_ns).unwrap();
        let sync = Rendezvous::open(&consumer_ns, crate::names::DETECT_RENDER_SYNC).unwrap();
        let ack = Rendezvous::open(&consumer_ns, ACK).unwrap();
        let mut seen = Vec::new();
        for _ in 0..ROUNDS {
            sync.wait().unwrap();
            let boxes = detections.latest().unwrap();
            seen.push(boxes[0].x);
            ack.signal().unwrap();
        }
        seen
    });

    producer.join().unwrap();
    let seen = consumer.join().unwrap();
    assert_eq!(seen, (0..ROUNDS).collect::<Vec<_>>());

    DetectionChannel::force_remove(&ns);
    Rendezvous::force_remove(&ns, crate::names::DETECT_RENDER_SYNC);
    Rendezvous::force_remove(&ns, ACK);
}
