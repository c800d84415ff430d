//! Trellis integration test harness.
//!
//! Tests here wire real stores, the resumption cache, the pool and the pool
//! task together against in-process collaborators. The establisher plays
//! both ends of the handshake: for every remote peer it keeps a
//! responder-side resumption cache on its own store, and accepts a
//! resumption hint only if that responder finds the id with a matching
//! secret.
//!
//!   RUST_LOG=trellis_sessions=debug cargo test --test integration
//!
//! Tests that touch the filesystem use their own directory under the
//! system temp dir and remove it when done.

mod config;
mod pool;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use trellis_core::config::PoolConfig;
use trellis_core::{AuthTags, NodeId, PeerId, ResumptionId, SessionError, SessionSecret};
use trellis_sessions::{
    AddressResolver, DeviceSessionPool, Establishment, MemoryRecordStore, PoolHandle, PoolService,
    RecordStore, ResumptionHint, SecureChannelEstablisher, SessionHandle, SessionResumptionCache,
};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Node id this side presents to every responder.
pub const LOCAL_NODE: u64 = 0x00C0_FFEE;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh, empty directory for one test.
pub fn temp_dir(label: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "trellis-it-{label}-{}-{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub fn address_of(peer: PeerId) -> SocketAddr {
    SocketAddr::from(([10, peer.fabric.0, 0, peer.node.0 as u8], 5540))
}

// ── Collaborators ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockSession {
    pub peer: PeerId,
    pub resumed: bool,
    closed: AtomicBool,
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SessionHandle for MockSession {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct HandshakeStats {
    pub attempts: AtomicUsize,
    pub full: AtomicUsize,
    pub resumed: AtomicUsize,
}

impl HandshakeStats {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn full(&self) -> usize {
        self.full.load(Ordering::SeqCst)
    }

    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }
}

/// Handshake against simulated remote peers.
#[derive(Default)]
pub struct LoopbackEstablisher {
    responders: Mutex<HashMap<PeerId, SessionResumptionCache>>,
    failing: Mutex<HashSet<PeerId>>,
    latency: Duration,
    pub stats: Arc<HandshakeStats>,
    sessions: Arc<Mutex<Vec<Arc<MockSession>>>>,
}

impl LoopbackEstablisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, peer: PeerId, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    /// The remote peer loses its resumption state for us.
    pub fn forget(&self, peer: PeerId) {
        self.responder(peer).delete(initiator_for(peer)).unwrap();
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    fn responder(&self, peer: PeerId) -> SessionResumptionCache {
        self.responders
            .lock()
            .unwrap()
            .entry(peer)
            .or_insert_with(|| {
                SessionResumptionCache::new(Arc::new(MemoryRecordStore::new()) as Arc<dyn RecordStore>)
            })
            .clone()
    }
}

fn initiator_for(peer: PeerId) -> PeerId {
    PeerId {
        fabric: peer.fabric,
        node: NodeId(LOCAL_NODE),
    }
}

impl SecureChannelEstablisher for LoopbackEstablisher {
    fn establish(
        &self,
        peer: PeerId,
        _address: SocketAddr,
        resumption: Option<ResumptionHint>,
    ) -> BoxFuture<'static, Result<Establishment, SessionError>> {
        self.stats.attempts.fetch_add(1, Ordering::SeqCst);
        let responder = self.responder(peer);
        let failing = self.failing.lock().unwrap().contains(&peer);
        let latency = self.latency;
        let stats = self.stats.clone();
        let initiator = initiator_for(peer);
        let sessions = self.sessions.clone();

        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if failing {
                return Err(SessionError::handshake("peer unreachable"));
            }

            let resumed = resumption.as_ref().is_some_and(|hint| {
                matches!(
                    responder.find_by_resumption_id(&hint.resumption_id),
                    Ok(Some(found)) if found.peer == initiator && found.secret == hint.secret
                )
            });
            if resumed {
                stats.resumed.fetch_add(1, Ordering::SeqCst);
            } else {
                stats.full.fetch_add(1, Ordering::SeqCst);
            }

            let resumption_id = ResumptionId::random();
            let secret = SessionSecret::random();
            responder
                .save(initiator, resumption_id, &secret, AuthTags::EMPTY)
                .map_err(|e| SessionError::handshake(format!("responder: {e}")))?;

            let session = Arc::new(MockSession {
                peer,
                resumed,
                closed: AtomicBool::new(false),
            });
            sessions.lock().unwrap().push(session.clone());
            Ok(Establishment {
                session,
                resumption_id,
                secret,
                tags: AuthTags::EMPTY,
                resumed,
            })
        })
    }
}

/// Fixed address table.
#[derive(Default)]
pub struct TableResolver {
    known: HashSet<PeerId>,
    /// Answer from the discovery cache without an async lookup.
    cached: bool,
}

impl TableResolver {
    pub fn knowing(peers: &[PeerId]) -> Self {
        Self {
            known: peers.iter().copied().collect(),
            cached: false,
        }
    }

    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }
}

impl AddressResolver for TableResolver {
    fn resolve(&self, peer: PeerId) -> BoxFuture<'static, Result<SocketAddr, SessionError>> {
        let known = self.known.contains(&peer);
        Box::pin(async move {
            tokio::task::yield_now().await;
            if known {
                Ok(address_of(peer))
            } else {
                Err(SessionError::AddressResolutionFailed)
            }
        })
    }

    fn cached_address(&self, peer: PeerId) -> Option<SocketAddr> {
        (self.cached && self.known.contains(&peer)).then(|| address_of(peer))
    }
}

// ── Running pool ──────────────────────────────────────────────────────────────

pub struct RunningPool {
    pub handle: PoolHandle,
    pub shutdown: broadcast::Sender<()>,
    pub task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RunningPool {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.unwrap().unwrap();
    }
}

pub fn start_pool(
    store: Arc<dyn RecordStore>,
    establisher: Arc<LoopbackEstablisher>,
    resolver: TableResolver,
) -> RunningPool {
    init_tracing();
    let cache: SessionResumptionCache = SessionResumptionCache::new(store);
    let pool = DeviceSessionPool::new(cache, establisher, Arc::new(resolver));
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let (service, handle) = PoolService::new(pool, &PoolConfig::default(), shutdown_rx);
    RunningPool {
        handle,
        shutdown,
        task: tokio::spawn(service.run()),
    }
}
