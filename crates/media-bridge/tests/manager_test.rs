//! Call registry and event dispatch through the bridge manager

mod common;

use std::path::Path;
use std::time::Duration;

use common::*;
use siprtsp_media_bridge::{
    AudioPort, BridgeConfig, BridgeError, BridgeManager, CallId, CaptureConfig, CommandSpec, PlaybackConfig,
    PortState, SessionState,
};

/// Pipe transports: speaker drains stdin, mic emits nothing
fn pipe_config(root: &Path, speaker: CommandSpec) -> BridgeConfig {
    BridgeConfig::default()
        .with_fifo_root(root)
        .with_stop_policy(quick_stop())
        .with_playback(PlaybackConfig::new(narrowband(), speaker))
        .with_capture(CaptureConfig::new(narrowband(), sh("mic {call_id}", "exec sleep 5")))
        .with_ack_timeout(Duration::from_secs(32))
}

#[test]
fn test_confirm_and_disconnect_lifecycle() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let manager = BridgeManager::new(pipe_config(dir.path(), CommandSpec::new("spk {call_id}", "cat"))).unwrap();

    let endpoint = RecordingEndpoint::new();
    assert!(manager.on_call_confirmed(1u32, endpoint.clone()).unwrap());
    assert!(manager.on_call_confirmed(2u32, RecordingEndpoint::new()).unwrap());
    assert_eq!(manager.active_calls(), [CallId::from(1u32), CallId::from(2u32)]);

    let session = manager.session(&CallId::from(1u32)).unwrap();
    assert_eq!(session.state(), SessionState::Active { mic_ready: true });

    manager.on_call_disconnected(1u32);
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.playback().state(), PortState::Stopped);
    assert!(manager.session(&CallId::from(1u32)).is_none());
    assert_eq!(endpoint.events().last(), Some(&EndpointEvent::DetachAll));

    // Unknown and repeated disconnects are no-ops
    manager.on_call_disconnected(1u32);
    manager.on_call_disconnected("never-seen");
    assert_eq!(manager.len(), 1);

    manager.shutdown();
    assert!(manager.is_empty());
}

#[test]
fn test_duplicate_confirmation_keeps_running_session() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let manager = BridgeManager::new(pipe_config(dir.path(), CommandSpec::new("spk {call_id}", "cat"))).unwrap();

    manager.on_call_confirmed("dup", RecordingEndpoint::new()).unwrap();
    let first = manager.session(&CallId::from("dup")).unwrap();
    let pid = first.playback().pid().unwrap();

    let second = RecordingEndpoint::new();
    let err = manager.on_call_confirmed("dup", second.clone()).unwrap_err();
    assert!(matches!(err, BridgeError::SessionExists(_)));
    assert!(second.events().is_empty());
    assert_eq!(first.playback().pid(), Some(pid));
    assert_eq!(first.playback().state(), PortState::Running);

    manager.shutdown();
    assert!(!pid_alive(pid));
}

#[test]
fn test_failed_confirmation_is_not_registered() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let manager =
        BridgeManager::new(pipe_config(dir.path(), CommandSpec::new("spk {call_id}", "/nonexistent/ffmpeg"))).unwrap();

    let err = manager.on_call_confirmed(3u32, RecordingEndpoint::new()).unwrap_err();
    assert!(matches!(err, BridgeError::Spawn { .. }));
    assert!(manager.is_empty());

    // Disconnect after a failed confirmation finds nothing to stop
    manager.on_call_disconnected(3u32);
    assert!(manager.session(&CallId::from(3u32)).is_none());
}

#[test]
fn test_snapshots_report_both_directions() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let manager = BridgeManager::new(pipe_config(dir.path(), CommandSpec::new("spk {call_id}", "cat"))).unwrap();
    let endpoint = RecordingEndpoint::new();
    manager.on_call_confirmed(4u32, endpoint.clone()).unwrap();

    endpoint.playback().unwrap().deliver_frame(&[0u8; 320]);
    let _ = endpoint.capture().unwrap().request_frame(0);

    let snapshots = manager.snapshots();
    assert_eq!(snapshots.len(), 1);
    let snapshot = &snapshots[0];
    assert_eq!(snapshot.call_id, CallId::from(4u32));
    assert_eq!(snapshot.playback.frames_written, 1);
    assert_eq!(snapshot.capture.frames_served, 1);
    assert_eq!(snapshot.capture_state, PortState::Running);

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_warns_once_through_manager() {
    let manager = BridgeManager::new(BridgeConfig::default()).unwrap();
    let mut warnings = manager.start_monitor().unwrap();

    manager.on_invite_received(20u32);
    manager.on_provisional_sent(20u32);
    manager.on_invite_received(21u32);
    manager.on_provisional_sent(21u32);
    manager.on_ack_received(21u32);

    let warning = tokio::time::timeout(Duration::from_secs(40), warnings.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(warning.call_id, CallId::from(20u32));
    assert!(warning.elapsed >= Duration::from_secs(32));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(warnings.try_recv().is_err());

    manager.on_call_disconnected(20u32);
    manager.on_call_disconnected(21u32);
    assert_eq!(manager.monitor().tracked(), 0);
    manager.shutdown();
}
