//! Integration tests for the pairing handshake between two nodes.

mod common;

use assert_matches::assert_matches;
use common::{free_port, start_node, RecordingFrontend};
use pretty_assertions::assert_eq;
use syncpair::state::{LoadOutcome, StateStore};
use syncpair::{PeerAddress, SyncError};
use tempfile::TempDir;

fn saved_peer(path: &std::path::Path) -> Option<PeerAddress> {
    match StateStore::new(path).load() {
        LoadOutcome::Loaded(record) => record.peer,
        other => panic!("expected a saved record at {}, got {other:?}", path.display()),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accepted_pairing_is_saved_on_both_sides() {
    let temp_dir = TempDir::new().unwrap();
    let a = start_node(temp_dir.path(), "a", RecordingFrontend::declining()).await;
    let b_ui = RecordingFrontend::accepting();
    let b = start_node(temp_dir.path(), "b", b_ui.clone()).await;

    a.connect(&b.address()).await.unwrap();

    assert_eq!(a.peer(), Some(b.address()));
    assert_eq!(b.peer(), Some(a.address()));
    assert_eq!(b_ui.prompts(), 1);

    assert_eq!(saved_peer(&a.state_file()), Some(b.address()));
    assert_eq!(saved_peer(&b.state_file()), Some(a.address()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declined_pairing_changes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let a_ui = RecordingFrontend::declining();
    let a = start_node(temp_dir.path(), "a", a_ui.clone()).await;
    let b = start_node(temp_dir.path(), "b", RecordingFrontend::declining()).await;

    let result = a.connect(&b.address()).await;

    assert_matches!(result, Err(SyncError::PeerDeclined(addr)) if addr == b.address());
    assert_eq!(a.peer(), None);
    assert_eq!(b.peer(), None);
    assert!(!a.state_file().exists());
    assert!(!b.state_file().exists());
    assert!(a_ui.saw("Pairing declined"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_to_current_peer_skips_handshake() {
    let temp_dir = TempDir::new().unwrap();
    let a = start_node(temp_dir.path(), "a", RecordingFrontend::declining()).await;
    let b_ui = RecordingFrontend::accepting();
    let b = start_node(temp_dir.path(), "b", b_ui.clone()).await;

    a.connect(&b.address()).await.unwrap();
    b.stop().await;

    // No network round trip: works even though the peer is down.
    let client = a.connect(&b.address()).await.unwrap();
    assert_eq!(client.target(), &b.address());
    assert_eq!(b_ui.prompts(), 1);

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_target_when_never_paired() {
    let temp_dir = TempDir::new().unwrap();
    let a_ui = RecordingFrontend::declining();
    let a = start_node(temp_dir.path(), "a", a_ui.clone()).await;
    let nobody = PeerAddress::new("127.0.0.1", free_port());

    let result = a.connect(&nobody).await;

    assert_matches!(
        result,
        Err(SyncError::PeerUnreachable { previously_paired: false, .. })
    );
    assert!(a_ui.saw("Connection failed"));
    assert_eq!(a.peer(), None);

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_target_keeps_existing_pairing() {
    let temp_dir = TempDir::new().unwrap();
    let a_ui = RecordingFrontend::declining();
    let a = start_node(temp_dir.path(), "a", a_ui.clone()).await;
    let b = start_node(temp_dir.path(), "b", RecordingFrontend::accepting()).await;
    a.connect(&b.address()).await.unwrap();

    let nobody = PeerAddress::new("127.0.0.1", free_port());
    let result = a.connect(&nobody).await;

    assert_matches!(
        result,
        Err(SyncError::PeerUnreachable { previously_paired: true, .. })
    );
    assert!(a_ui.saw("Peer offline"));
    assert_eq!(a.peer(), Some(b.address()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_pairing_replaces_old_peer() {
    let temp_dir = TempDir::new().unwrap();
    let a = start_node(temp_dir.path(), "a", RecordingFrontend::declining()).await;
    let b = start_node(temp_dir.path(), "b", RecordingFrontend::accepting()).await;
    let c = start_node(temp_dir.path(), "c", RecordingFrontend::accepting()).await;

    a.connect(&b.address()).await.unwrap();
    a.connect(&c.address()).await.unwrap();

    assert_eq!(a.peer(), Some(c.address()));
    assert_eq!(saved_peer(&a.state_file()), Some(c.address()));

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declined_repairing_keeps_old_peer() {
    let temp_dir = TempDir::new().unwrap();
    let a = start_node(temp_dir.path(), "a", RecordingFrontend::declining()).await;
    let b = start_node(temp_dir.path(), "b", RecordingFrontend::accepting()).await;
    let c = start_node(temp_dir.path(), "c", RecordingFrontend::declining()).await;

    a.connect(&b.address()).await.unwrap();
    assert_matches!(a.connect(&c.address()).await, Err(SyncError::PeerDeclined(_)));

    assert_eq!(a.peer(), Some(b.address()));
    assert_eq!(saved_peer(&a.state_file()), Some(b.address()));

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_to_self_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let a = start_node(temp_dir.path(), "a", RecordingFrontend::accepting()).await;

    assert_matches!(
        a.connect(&a.address()).await,
        Err(SyncError::InvalidAddress(_))
    );
    assert_eq!(a.peer(), None);

    a.stop().await;
}
