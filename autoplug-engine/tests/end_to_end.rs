//! End-to-end tests driven by scenario files
//!
//! Loads a TOML scenario from disk, plays a movie with a demuxer and two
//! decoders, queues a second input for gapless playback and runs both
//! through to the end.

mod helpers;

use autoplug_common::events::{StreamClassification, StreamInfo};
use autoplug_common::{AutoplugEvent, EngineConfig};
use autoplug_engine::element::ElementState;
use autoplug_engine::sim::Scenario;
use autoplug_engine::{DecodeBin, Input};
use helpers::*;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

const MOVIE: &str = r#"
[input]
caps = "video/quicktime"
uri = "file:///media/clip.mov"

[[factory]]
name = "qtdemux"
kind = "demuxer"
sink_caps = "video/quicktime"
outputs = [{ name = "src_%u", presence = "created-later", caps = "ANY" }]

[factory.script]
ports = [
    { name = "src_0", caps = "video/x-h264" },
    { name = "src_1", caps = "audio/mpeg" },
]

[[factory]]
name = "avdec_h264"
kind = "decoder"
sink_caps = "video/x-h264"
outputs = [{ name = "src", caps = "video/x-raw" }]

[[factory]]
name = "mpg123"
kind = "decoder"
rank = 128
sink_caps = "audio/mpeg"
outputs = [{ name = "src", caps = "audio/x-raw" }]
"#;

const RADIO: &str = r#"
[input]
caps = "audio/x-raw"
uri = "http://radio.example.com/stream"
name = "httpsrc"
"#;

// ============================================================================
// Test Helpers
// ============================================================================

fn write_scenario(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load(content: &str) -> Scenario {
    let file = write_scenario(content);
    Scenario::load(file.path()).expect("scenario loads")
}

fn switched_streams(events: &[AutoplugEvent]) -> (Uuid, Vec<StreamInfo>) {
    events
        .iter()
        .find_map(|e| match e {
            AutoplugEvent::GroupSwitched {
                group_id, streams, ..
            } => Some((*group_id, streams.clone())),
            _ => None,
        })
        .expect("group switched")
}

/// Report end of stream on every stream, off the async runtime
async fn finish_streams(bin: &Arc<DecodeBin>, streams: &[StreamInfo]) {
    let bin = Arc::clone(bin);
    let ids: Vec<Uuid> = streams.iter().map(|s| s.stream_id).collect();
    tokio::task::spawn_blocking(move || {
        for id in ids {
            bin.stream_eos(id).expect("eos");
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_movie_then_gapless_next_input() {
    let scenario = load(MOVIE);
    let (registry, factories) = scenario.build_registry();
    assert_eq!(factories.len(), 3);
    let bin = Arc::new(DecodeBin::new(EngineConfig::default(), registry).unwrap());
    let mut rx = bin.subscribe();

    bin.set_input(scenario.input()).unwrap();
    bin.expect_next_input();
    let events = collect_until(&mut rx, is_switched).await;
    assert_eq!(events.iter().filter(|e| is_committed(e)).count(), 1);

    let (first, streams) = switched_streams(&events);
    assert_eq!(streams.len(), 2);
    let video = streams
        .iter()
        .find(|s| s.classification == StreamClassification::Video)
        .expect("video stream");
    let audio = streams
        .iter()
        .find(|s| s.classification == StreamClassification::Audio)
        .expect("audio stream");
    assert!(video.element.starts_with("avdec_h264"));
    assert!(audio.element.starts_with("mpg123"));
    assert_eq!(video.port, "src");

    // queue a plain mp3 behind the movie
    bin.set_next_input(Input::from_element(named_source("next", "audio/mpeg")))
        .unwrap();
    let events = drain(&mut rx);
    assert_eq!(names(&events).last(), Some(&"GroupCommitted"));
    assert!(!events.iter().any(is_switched));
    assert_eq!(bin.snapshot().queued.len(), 2);

    finish_streams(&bin, &streams).await;
    let events = collect_until(&mut rx, is_switched).await;
    let (second, next_streams) = switched_streams(&events);
    assert_ne!(first, second);
    assert_eq!(next_streams.len(), 1);
    assert!(next_streams[0].element.starts_with("mpg123"));

    // the movie's elements are gone
    let demux = factories[0].instances()[0].clone();
    assert_eq!(demux.state(), ElementState::Null);
    let names_left: Vec<String> = bin.snapshot().elements.into_iter().map(|e| e.name).collect();
    assert_eq!(names_left.len(), 2);
    assert!(names_left.contains(&"next".to_string()));

    finish_streams(&bin, &next_streams).await;
    let events = collect_until(&mut rx, |e| matches!(e, AutoplugEvent::Drained { .. })).await;
    match events.last() {
        Some(AutoplugEvent::Drained { group_id, .. }) => assert_eq!(*group_id, second),
        other => panic!("unexpected {:?}", other),
    }
    assert!(bin.snapshot().queued.is_empty());

    bin.stop();
    assert!(bin.snapshot().elements.is_empty());
}

#[tokio::test]
async fn test_streamed_uri_enables_buffering() {
    let scenario = load(RADIO);
    let (registry, _) = scenario.build_registry();
    let bin = DecodeBin::new(EngineConfig::default(), registry).unwrap();
    let mut rx = bin.subscribe();

    bin.set_input(scenario.input()).unwrap();
    let events = drain(&mut rx);
    let (_, streams) = switched_streams(&events);
    assert_eq!(streams[0].element, "httpsrc");
    assert!(bin.manager().is_streamed());

    let outputs = bin.active_outputs();
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].preroll.is_streamed());
    assert!(outputs[0].preroll.is_buffering());
}

#[test]
fn test_scenario_rejects_any_input() {
    let file = write_scenario("[input]\ncaps = \"ANY\"\n");
    assert!(Scenario::load(file.path()).is_err());
}
