//! Integration tests for PrerollBuffer watermarks
//!
//! Tests byte/time limits, the streamed-input deadlock relaxation,
//! buffering percentage reporting, end-of-stream handling, and the
//! overrun that forces a building group to commit.

mod helpers;

use autoplug_common::events::StreamClassification;
use autoplug_common::{AutoplugEvent, ClockTime, EngineConfig};
use autoplug_engine::preroll::{PrerollLimits, PrerollListener};
use autoplug_engine::sim::ScriptedFactory;
use autoplug_engine::{FactoryKind, Input, MediaBuffer, PrerollBuffer, PushOutcome, QueueItem};
use helpers::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct Recorder {
    overruns: AtomicUsize,
    percents: Mutex<Vec<u8>>,
}

impl PrerollListener for Recorder {
    fn on_overrun(&self, _buffer: &PrerollBuffer) {
        self.overruns.fetch_add(1, Ordering::SeqCst);
    }

    fn on_buffering(&self, _buffer: &PrerollBuffer, percent: u8) {
        self.percents.lock().unwrap().push(percent);
    }
}

fn ms(v: u64) -> ClockTime {
    ClockTime::from_mseconds(v)
}

fn streamed_limits(max_bytes: u64) -> PrerollLimits {
    PrerollLimits {
        max_bytes,
        max_time: ms(3000),
        low: ms(1000),
        high: ms(2000),
        streamed: true,
    }
}

fn recorded_buffer(limits: PrerollLimits) -> (PrerollBuffer, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let buffer = PrerollBuffer::new(
        StreamClassification::Audio,
        limits,
        Some(recorder.clone()),
    );
    (buffer, recorder)
}

fn percents(events: &[AutoplugEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            AutoplugEvent::BufferingPercent { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Byte limit deadlock
// ============================================================================

#[test]
fn test_byte_limit_lifted_below_time_threshold() {
    let (buf, recorder) = recorded_buffer(streamed_limits(1000));

    assert_eq!(buf.push(MediaBuffer::timed(ms(0), ms(10), 600)), PushOutcome::Queued);
    assert_eq!(buf.push(MediaBuffer::timed(ms(10), ms(10), 600)), PushOutcome::Queued);

    // 1200 bytes but only 20ms queued: the byte limit would stall buffering
    assert_eq!(buf.push(MediaBuffer::timed(ms(20), ms(10), 600)), PushOutcome::Queued);
    assert_eq!(recorder.overruns.load(Ordering::SeqCst), 1);
    assert!(buf.is_byte_limit_relaxed());
    assert_eq!(buf.max_bytes(), 0);
    assert_eq!(buf.level().bytes, 1800);

    // stays lifted across a flush
    buf.flush();
    assert_eq!(buf.max_bytes(), 0);
    assert!(buf.is_byte_limit_relaxed());
}

#[test]
fn test_untimed_data_keeps_byte_limit() {
    let (buf, recorder) = recorded_buffer(streamed_limits(1000));
    buf.push(MediaBuffer::untimed(600));
    buf.push(MediaBuffer::untimed(600));

    assert!(matches!(
        buf.push(MediaBuffer::untimed(600)),
        PushOutcome::Full(_)
    ));
    assert_eq!(recorder.overruns.load(Ordering::SeqCst), 1);
    assert!(!buf.is_byte_limit_relaxed());
    assert_eq!(buf.max_bytes(), 1000);
}

#[test]
fn test_time_limit_stops_relaxed_buffer() {
    let (buf, _recorder) = recorded_buffer(streamed_limits(100));
    buf.push(MediaBuffer::timed(ms(0), ms(10), 100));
    // relaxes, then fills by time
    for i in 1..400 {
        if let PushOutcome::Full(_) = buf.push(MediaBuffer::timed(ms(i * 10), ms(10), 100)) {
            assert_eq!(buf.level().time, ms(3000));
            return;
        }
    }
    panic!("time limit never reached");
}

// ============================================================================
// Buffering percentage and end of stream
// ============================================================================

#[test]
fn test_eos_ends_buffering_and_disarms_underrun() {
    let (buf, recorder) = recorded_buffer(streamed_limits(0));
    assert!(buf.is_buffering());

    buf.push(MediaBuffer::timed(ms(0), ms(100), 10));
    assert!(buf.push_eos());
    assert!(!buf.is_buffering());

    assert!(matches!(buf.pop(), Some(QueueItem::Buffer(_))));
    assert_eq!(buf.pop(), Some(QueueItem::Eos));
    assert!(buf.pop().is_none());
    assert!(!buf.is_buffering(), "underrun after EOS is ignored");
    assert_eq!(*recorder.percents.lock().unwrap(), vec![10, 100]);

    buf.flush();
    assert!(buf.is_buffering());
    assert_eq!(buf.min_threshold(), ms(1000));
    assert!(!buf.is_eos());
}

#[tokio::test]
async fn test_buffering_percent_monotonic_until_threshold() {
    let mut config = EngineConfig::default();
    config.buffering.queue_size_ms = 1000;
    let mut h = Harness::with_config(config, vec![]);
    h.bin
        .set_input(Input::from_uri(
            "http://radio.example.com/live",
            source("audio/x-raw"),
        ))
        .unwrap();
    h.drain();

    let outputs = h.bin.active_outputs();
    assert_eq!(outputs.len(), 1);
    let preroll = Arc::clone(&outputs[0].preroll);
    assert!(preroll.is_streamed());
    assert!(preroll.is_buffering());
    assert_eq!(preroll.min_threshold(), ms(300));

    for i in 0..6 {
        preroll.push(MediaBuffer::timed(ms(i * 50), ms(50), 10));
    }
    assert_eq!(percents(&h.drain()), vec![16, 33, 50, 66, 83, 100]);
    assert!(!preroll.is_buffering());

    // drop below the low watermark: threshold rises to the high watermark
    assert!(matches!(preroll.pop(), Some(QueueItem::Buffer(_))));
    assert!(preroll.pop().is_none());
    assert!(preroll.is_buffering());
    assert_eq!(preroll.min_threshold(), ms(950));
    assert_eq!(percents(&h.drain()), vec![26]);
}

#[tokio::test]
async fn test_group_reports_slowest_stream() {
    let mut config = EngineConfig::default();
    config.buffering.queue_size_ms = 1000;
    let movie = ScriptedFactory::builder("avidemux", FactoryKind::Demuxer)
        .sink_caps(caps("video/x-msvideo"))
        .always_output("audio_0", caps("audio/x-raw"))
        .always_output("video_0", caps("video/x-raw"))
        .build();
    let mut h = Harness::with_config(config, vec![movie]);
    h.bin
        .set_input(Input::from_uri(
            "http://tv.example.com/live.avi",
            source("video/x-msvideo"),
        ))
        .unwrap();
    h.drain();

    let outputs = h.bin.active_outputs();
    assert_eq!(outputs.len(), 2);
    let preroll = |c: StreamClassification| {
        outputs
            .iter()
            .find(|o| o.classification == c)
            .map(|o| Arc::clone(&o.preroll))
            .expect("output slot")
    };
    let audio = preroll(StreamClassification::Audio);
    let video = preroll(StreamClassification::Video);

    // audio fills completely while video has nothing queued
    for i in 0..20 {
        audio.push(MediaBuffer::timed(ms(i * 50), ms(50), 10));
    }
    assert!(!audio.is_buffering());
    assert_eq!(percents(&h.drain()), vec![0]);

    for i in 0..6 {
        video.push(MediaBuffer::timed(ms(i * 50), ms(50), 10));
    }
    assert_eq!(percents(&h.drain()), vec![16, 33, 50, 66, 83, 100]);
}

#[tokio::test]
async fn test_local_input_never_buffers() {
    let mut h = Harness::new(vec![]);
    h.bin
        .set_input(Input::from_uri("file:///music/a.wav", source("audio/x-raw")))
        .unwrap();
    h.drain();

    let preroll = Arc::clone(&h.bin.active_outputs()[0].preroll);
    assert!(!preroll.is_buffering());
    preroll.push(MediaBuffer::timed(ms(0), ms(10), 10));
    assert!(matches!(preroll.pop(), Some(QueueItem::Buffer(_))));
    assert!(preroll.pop().is_none());
    assert!(percents(&h.drain()).is_empty());
}

// ============================================================================
// Overrun during build
// ============================================================================

#[tokio::test]
async fn test_overrun_forces_commit_of_building_group() {
    let mut config = EngineConfig::default();
    config.buffering.other_max_bytes = 100;
    let mut h = Harness::with_config(config, vec![demuxer("oggdemux", "application/ogg").build()]);
    h.bin
        .set_input(Input::from_element(source("application/ogg")))
        .unwrap();

    let demux = h.element("oggdemux", 0);
    demux.add_port("src_0", caps("audio/x-raw"));

    let mut stream_id = None;
    for _ in 0..100 {
        let snapshot = h.bin.snapshot();
        if let Some(stream) = snapshot.building.and_then(|g| g.streams.first().cloned()) {
            stream_id = Some(stream.stream_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stream_id = stream_id.expect("stream added to the building group");
    let preroll = h.bin.preroll_buffer(stream_id).expect("preroll buffer");

    assert_eq!(preroll.push(MediaBuffer::timed(ms(0), ms(10), 100)), PushOutcome::Queued);
    assert!(matches!(
        preroll.push(MediaBuffer::timed(ms(10), ms(10), 10)),
        PushOutcome::Full(_)
    ));

    let events = h.drain();
    assert!(events.iter().any(is_switched), "overrun commits the group");
    let snapshot = h.bin.snapshot();
    assert!(snapshot.building.is_none());
    assert_eq!(snapshot.queued.len(), 1);

    // the watcher finishing later commits nothing more
    demux.no_more_ports();
    let events = h.settle().await;
    assert!(!events.iter().any(is_committed));
}
