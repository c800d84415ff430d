use crate::*;

use trellis_core::FabricIndex;
use trellis_sessions::FileRecordStore;

const A: PeerId = PeerId {
    fabric: FabricIndex(1),
    node: NodeId(0xA),
};
const B: PeerId = PeerId {
    fabric: FabricIndex(2),
    node: NodeId(0xB),
};

fn memory() -> Arc<dyn RecordStore> {
    Arc::new(MemoryRecordStore::new())
}

/// Release keeps resumption material; the next connect resumes.
#[tokio::test]
async fn test_reconnect_after_release_resumes() {
    let establisher = Arc::new(LoopbackEstablisher::new());
    let pool = start_pool(memory(), establisher.clone(), TableResolver::knowing(&[A]));

    let first = pool.handle.connect(A).await.unwrap();
    assert!(!first.resumed);
    assert_eq!(first.address, address_of(A));

    assert!(pool.handle.release(A).await.unwrap());
    assert!(establisher.sessions()[0].is_closed());

    let second = pool.handle.connect(A).await.unwrap();
    assert!(second.resumed);
    assert_eq!(establisher.stats.full(), 1);
    assert_eq!(establisher.stats.resumed(), 1);

    pool.stop().await;
}

/// A responder that lost our record forces a full handshake, and the fresh
/// material replaces the rejected one.
#[tokio::test]
async fn test_rejected_resumption_falls_back_to_full() {
    let establisher = Arc::new(LoopbackEstablisher::new());
    let pool = start_pool(memory(), establisher.clone(), TableResolver::knowing(&[A]).cached());

    pool.handle.connect(A).await.unwrap();
    pool.handle.release(A).await.unwrap();
    establisher.forget(A);

    let again = pool.handle.connect(A).await.unwrap();
    assert!(!again.resumed);
    assert_eq!(establisher.stats.full(), 2);

    // The material saved after the fallback is good for the next round.
    pool.handle.release(A).await.unwrap();
    assert!(pool.handle.connect(A).await.unwrap().resumed);

    pool.stop().await;
}

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    let establisher = Arc::new(LoopbackEstablisher::with_latency(Duration::from_millis(20)));
    let pool = start_pool(memory(), establisher.clone(), TableResolver::knowing(&[A]));

    let results = futures::future::join_all((0..32).map(|_| pool.handle.connect(A))).await;
    let devices: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(establisher.stats.attempts(), 1);
    assert!(devices
        .iter()
        .all(|d| Arc::ptr_eq(&d.session, &devices[0].session)));

    pool.stop().await;
}

/// Every waiter of a failed attempt hears the same error, and the failure
/// leaves nothing behind.
#[tokio::test]
async fn test_failure_reaches_every_waiter() {
    let establisher = Arc::new(LoopbackEstablisher::with_latency(Duration::from_millis(10)));
    establisher.set_failing(A, true);
    let pool = start_pool(memory(), establisher.clone(), TableResolver::knowing(&[A]));

    let results = futures::future::join_all((0..5).map(|_| pool.handle.connect(A))).await;
    for result in results {
        assert_eq!(
            result.unwrap_err(),
            SessionError::handshake("peer unreachable")
        );
    }
    assert_eq!(establisher.stats.attempts(), 1);
    assert!(pool.handle.find_existing(A).await.unwrap().is_none());

    establisher.set_failing(A, false);
    assert!(pool.handle.connect(A).await.is_ok());
    assert_eq!(establisher.stats.attempts(), 2);

    pool.stop().await;
}

#[tokio::test]
async fn test_unknown_address_fails_connect() {
    let establisher = Arc::new(LoopbackEstablisher::new());
    let pool = start_pool(memory(), establisher.clone(), TableResolver::knowing(&[]));

    let err = pool.handle.connect(A).await.unwrap_err();
    assert_eq!(err, SessionError::AddressResolutionFailed);
    assert_eq!(establisher.stats.attempts(), 0);
    assert_eq!(
        pool.handle.peer_address(A).await.unwrap_err(),
        SessionError::NotConnected
    );

    pool.stop().await;
}

/// Fabric removal closes that fabric's sessions and forgets its resumption
/// material; other fabrics are untouched.
#[tokio::test]
async fn test_fabric_removal_forces_full_handshake() {
    let establisher = Arc::new(LoopbackEstablisher::new());
    let pool = start_pool(memory(), establisher.clone(), TableResolver::knowing(&[A, B]));

    pool.handle.connect(A).await.unwrap();
    pool.handle.connect(B).await.unwrap();

    pool.handle.fabric_removed(FabricIndex(1)).await.unwrap();
    assert!(pool.handle.find_existing(A).await.unwrap().is_none());
    assert!(pool.handle.find_existing(B).await.unwrap().is_some());

    let sessions = establisher.sessions();
    assert!(sessions.iter().find(|s| s.peer == A).unwrap().is_closed());
    assert!(!sessions.iter().find(|s| s.peer == B).unwrap().is_closed());

    assert!(!pool.handle.connect(A).await.unwrap().resumed);

    assert_eq!(pool.handle.release_fabric(FabricIndex(2)).await.unwrap(), 1);
    assert!(pool.handle.connect(B).await.unwrap().resumed);

    pool.stop().await;
}

/// Resumption material on disk outlives the pool that wrote it.
#[tokio::test]
async fn test_resumption_survives_restart() {
    let dir = temp_dir("restart");
    let establisher = Arc::new(LoopbackEstablisher::new());

    let store: Arc<dyn RecordStore> = Arc::new(FileRecordStore::new(&dir).unwrap());
    let pool = start_pool(store, establisher.clone(), TableResolver::knowing(&[A]));
    assert!(!pool.handle.connect(A).await.unwrap().resumed);
    pool.stop().await;
    assert!(establisher.sessions()[0].is_closed());

    let store: Arc<dyn RecordStore> = Arc::new(FileRecordStore::new(&dir).unwrap());
    let pool = start_pool(store, establisher.clone(), TableResolver::knowing(&[A]));
    assert!(pool.handle.connect(A).await.unwrap().resumed);
    pool.stop().await;

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_stopped_pool_reports_shutdown() {
    let establisher = Arc::new(LoopbackEstablisher::new());
    let pool = start_pool(memory(), establisher, TableResolver::knowing(&[A]));
    let handle = pool.handle.clone();
    pool.stop().await;

    assert_eq!(handle.connect(A).await.unwrap_err(), SessionError::ShutDown);
    assert_eq!(handle.release_all().await.unwrap_err(), SessionError::ShutDown);
}
