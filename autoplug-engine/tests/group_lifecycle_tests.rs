//! Integration tests for the group lifecycle
//!
//! Drives GroupManager directly: commit and output preparation, gapless
//! promotion, drain, stream selection, teardown and the side channel.

mod helpers;

use autoplug_common::events::{FailureKind, StreamClassification};
use autoplug_common::{AutoplugEvent, EngineConfig, EventBus};
use autoplug_engine::element::{ElementId, PortRef};
use autoplug_engine::group::StreamDescriptor;
use autoplug_engine::{Error, GroupManager, GroupState, MediaBuffer, PushOutcome};
use helpers::{caps, drain, names};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Test Helpers
// ============================================================================

fn setup() -> (Arc<GroupManager>, broadcast::Receiver<AutoplugEvent>) {
    let bus = EventBus::new(64);
    let rx = bus.subscribe();
    (GroupManager::new(Arc::new(EngineConfig::default()), bus), rx)
}

fn add(
    manager: &GroupManager,
    port: &str,
    caps_str: &str,
    classification: StreamClassification,
) -> Arc<StreamDescriptor> {
    manager
        .add_stream(
            PortRef::new(ElementId::from_raw(0), port),
            "demux",
            caps(caps_str),
            classification,
        )
        .expect("add stream")
}

fn audio(manager: &GroupManager, port: &str) -> Arc<StreamDescriptor> {
    add(manager, port, "audio/x-raw", StreamClassification::Audio)
}

fn switched_to(events: &[AutoplugEvent]) -> Option<Uuid> {
    events.iter().find_map(|e| match e {
        AutoplugEvent::GroupSwitched { group_id, .. } => Some(*group_id),
        _ => None,
    })
}

// ============================================================================
// Commit and output preparation
// ============================================================================

#[test]
fn test_commit_without_building_group_is_noop() {
    let (manager, mut rx) = setup();
    manager.commit(false, false).unwrap();
    manager.commit(false, false).unwrap();

    assert!(drain(&mut rx).is_empty());
    let snapshot = manager.snapshot();
    assert!(snapshot.building.is_none());
    assert!(snapshot.queued.is_empty());
}

#[test]
fn test_single_building_group() {
    let (manager, _rx) = setup();
    let held = manager.hold_building().unwrap();
    assert_eq!(manager.get_or_create_building_group().unwrap(), held);
    audio(&manager, "src_0");
    audio(&manager, "src_1");

    let snapshot = manager.snapshot();
    let building = snapshot.building.expect("building group");
    assert_eq!(building.id, held);
    assert_eq!(building.pending, 1);
    assert_eq!(building.streams.len(), 2);
    assert_eq!(building.state, GroupState::Building);
}

#[test]
fn test_release_hold_commits_first_group() {
    let (manager, mut rx) = setup();
    let group = manager.hold_building().unwrap();
    audio(&manager, "src_0");
    assert!(drain(&mut rx).is_empty(), "nothing announced while building");

    manager.release_hold(group).unwrap();
    let events = drain(&mut rx);
    assert_eq!(
        names(&events),
        vec!["NewElementaryStream", "GroupCommitted", "GroupSwitched"]
    );
    assert_eq!(switched_to(&events), Some(group));
    assert_eq!(manager.snapshot().active().map(|g| g.state), Some(GroupState::Active));
}

#[test]
fn test_watcher_keeps_group_open() {
    let (manager, mut rx) = setup();
    let demux = ElementId::from_raw(7);
    manager.register_watcher(demux).unwrap();
    audio(&manager, "src_0");
    assert!(drain(&mut rx).is_empty());
    assert_eq!(manager.snapshot().watchers, 1);

    // unwatched elements are ignored
    manager.watcher_finished(ElementId::from_raw(8)).unwrap();
    assert!(drain(&mut rx).is_empty());

    manager.watcher_finished(demux).unwrap();
    assert!(switched_to(&drain(&mut rx)).is_some());
    assert_eq!(manager.snapshot().watchers, 0);
}

#[test]
fn test_subtitle_without_video_fails() {
    let (manager, mut rx) = setup();
    add(&manager, "text_0", "text/x-raw", StreamClassification::Text);
    add(&manager, "audio_0", "audio/x-raw", StreamClassification::Audio);

    assert!(matches!(
        manager.commit(false, false),
        Err(Error::SubtitleWithoutVideo)
    ));
    let events = drain(&mut rx);
    assert_eq!(names(&events), vec!["Error"]);
    match &events[0] {
        AutoplugEvent::Error { kind, .. } => assert_eq!(*kind, FailureKind::SubtitleWithoutVideo),
        other => panic!("unexpected {:?}", other),
    }
    let snapshot = manager.snapshot();
    assert!(snapshot.building.is_none());
    assert!(snapshot.queued.is_empty());
}

#[test]
fn test_forced_empty_commit_has_no_playable_stream() {
    let (manager, mut rx) = setup();
    assert!(matches!(
        manager.commit(true, false),
        Err(Error::NoPlayableStream)
    ));
    match drain(&mut rx).as_slice() {
        [AutoplugEvent::Error { kind, .. }] => assert_eq!(*kind, FailureKind::NoPlayableStream),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_unknown_only_group_reports_missing_element() {
    let (manager, mut rx) = setup();
    manager
        .add_unknown(
            PortRef::new(ElementId::from_raw(0), "src"),
            "source",
            caps("application/x-weird"),
        )
        .unwrap();

    assert!(matches!(
        manager.commit(false, false),
        Err(Error::NoCandidates(_))
    ));
    let events = drain(&mut rx);
    assert_eq!(names(&events), vec!["UnknownType", "Error"]);
    match &events[1] {
        AutoplugEvent::Error { kind, .. } => assert_eq!(*kind, FailureKind::MissingElement),
        other => panic!("unexpected {:?}", other),
    }
}

// ============================================================================
// Promotion and drain
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gapless_promotion_waits_for_successor() {
    let (manager, mut rx) = setup();
    let a = audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    let first = manager.snapshot().active().map(|g| g.id).unwrap();
    let old_preroll = manager.preroll_buffer(a.id()).expect("preroll");
    drain(&mut rx);

    let second = manager.hold_building().unwrap();
    audio(&manager, "src_1");

    let m = Arc::clone(&manager);
    let eos = tokio::task::spawn_blocking(move || m.stream_eos(a.id()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!eos.is_finished(), "retire waits for the building successor");
    assert!(drain(&mut rx).is_empty());

    manager.release_hold(second).unwrap();
    eos.await.unwrap().unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        names(&events),
        vec!["NewElementaryStream", "GroupCommitted", "GroupSwitched"]
    );
    assert_eq!(switched_to(&events), Some(second));
    assert_ne!(first, second);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.queued.len(), 1);
    assert_eq!(snapshot.queued[0].id, second);
    assert!(matches!(
        old_preroll.push(MediaBuffer::untimed(10)),
        PushOutcome::Refused(_)
    ));
}

#[test]
fn test_queued_successor_promoted_without_waiting() {
    let (manager, mut rx) = setup();
    let a = audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    audio(&manager, "src_1");
    manager.commit(false, false).unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.queued.len(), 2);
    assert_eq!(snapshot.queued[1].state, GroupState::Queued);
    let second = snapshot.queued[1].id;
    drain(&mut rx);

    assert_eq!(manager.retire_active_and_promote().unwrap(), Some(second));
    assert_eq!(switched_to(&drain(&mut rx)), Some(second));
    assert!(manager.stream(a.id()).is_none());
}

#[test]
fn test_drained_without_successor() {
    let (manager, mut rx) = setup();
    let a = audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    drain(&mut rx);

    manager.stream_eos(a.id()).unwrap();
    assert_eq!(names(&drain(&mut rx)), vec!["Drained"]);
    assert!(manager.snapshot().queued.is_empty());

    // the next group is prepared as a first group again
    audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    assert!(switched_to(&drain(&mut rx)).is_some());
}

#[test]
fn test_muted_streams_do_not_hold_the_group() {
    let (manager, mut rx) = setup();
    let a0 = audio(&manager, "src_0");
    let a1 = audio(&manager, "src_1");
    manager.commit(false, false).unwrap();
    assert!(!a0.is_muted());
    assert!(a1.is_muted());
    drain(&mut rx);

    manager.stream_eos(a0.id()).unwrap();
    assert_eq!(names(&drain(&mut rx)), vec!["Drained"]);
}

#[test]
fn test_eos_on_unknown_stream() {
    let (manager, _rx) = setup();
    audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    assert!(matches!(
        manager.stream_eos(Uuid::new_v4()),
        Err(Error::InvalidSelection(_))
    ));
}

// ============================================================================
// Stream selection
// ============================================================================

#[test]
fn test_selection_carries_to_next_group() {
    let (manager, mut rx) = setup();
    let a0 = audio(&manager, "src_0");
    let a1 = audio(&manager, "src_1");
    manager.commit(false, false).unwrap();

    manager.select_stream(StreamClassification::Audio, 1).unwrap();
    assert!(a0.is_muted());
    assert!(!a1.is_muted());
    assert!(matches!(
        manager.select_stream(StreamClassification::Audio, 5),
        Err(Error::InvalidSelection(_))
    ));
    assert!(matches!(
        manager.select_stream(StreamClassification::Video, 0),
        Err(Error::InvalidSelection(_))
    ));

    audio(&manager, "src_2");
    audio(&manager, "src_3");
    manager.commit(false, false).unwrap();
    drain(&mut rx);

    // a0 is muted, so a1 finishing finishes the group
    manager.stream_eos(a1.id()).unwrap();
    let events = drain(&mut rx);
    match events.last() {
        Some(AutoplugEvent::GroupSwitched { streams, .. }) => {
            let muted: Vec<_> = streams.iter().map(|s| s.muted).collect();
            assert_eq!(muted, vec![true, false]);
        }
        other => panic!("unexpected {:?}", other),
    }
    let outputs = manager.active_outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].active_stream.as_ref().map(|s| s.index), Some(1));
}

#[test]
fn test_select_without_active_group() {
    let (manager, _rx) = setup();
    assert!(matches!(
        manager.select_stream(StreamClassification::Audio, 0),
        Err(Error::InvalidState(_))
    ));
}

// ============================================================================
// Teardown and side channel
// ============================================================================

#[test]
fn test_teardown_refuses_work_until_reset() {
    let (manager, mut rx) = setup();
    let a = audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    let preroll = manager.preroll_buffer(a.id()).unwrap();
    audio(&manager, "src_1");

    manager.teardown();
    assert!(manager.is_flushing());
    let snapshot = manager.snapshot();
    assert!(snapshot.building.is_none());
    assert!(snapshot.queued.is_empty());
    assert!(snapshot.flushing);
    assert!(matches!(
        preroll.push(MediaBuffer::untimed(1)),
        PushOutcome::Refused(_)
    ));

    assert!(matches!(
        manager.add_stream(
            PortRef::new(ElementId::from_raw(0), "src"),
            "demux",
            caps("audio/x-raw"),
            StreamClassification::Audio,
        ),
        Err(Error::Flushing)
    ));
    assert!(matches!(
        manager.get_or_create_building_group(),
        Err(Error::Flushing)
    ));
    drain(&mut rx);

    manager.reset();
    assert!(!manager.is_flushing());
    audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    assert!(switched_to(&drain(&mut rx)).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_side_channel_commit_wakes_waiter() {
    let (manager, mut rx) = setup();
    let m = Arc::clone(&manager);
    let waiter = tokio::task::spawn_blocking(move || m.wait_side_channel());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    audio(&manager, "src_0");
    manager.commit(false, true).unwrap();
    waiter.await.unwrap().unwrap();

    // the building group is untouched
    assert!(drain(&mut rx).is_empty());
    assert!(manager.snapshot().building.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_wakes_blocked_waiters() {
    let (manager, _rx) = setup();
    audio(&manager, "src_0");
    manager.commit(false, false).unwrap();
    manager.expect_next_input(true);

    let m = Arc::clone(&manager);
    let retire = tokio::task::spawn_blocking(move || m.retire_active_and_promote());
    let m = Arc::clone(&manager);
    let side = tokio::task::spawn_blocking(move || m.wait_side_channel());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!retire.is_finished(), "waiting for the next input");

    manager.teardown();
    assert!(matches!(retire.await.unwrap(), Err(Error::Flushing)));
    assert!(matches!(side.await.unwrap(), Err(Error::Flushing)));
}
