//! Device session pool — at most one session, or one attempt, per peer.
//!
//! Per-peer state machine:
//!
//!   Idle ──connect──▶ Pending ──ok──▶ Established ──release──▶ Idle
//!                        └──────fail──────────────────────────▶ Idle
//!
//! Idle has no representation: a peer absent from both tables is idle, so
//! memory tracks active peers only. Concurrent connects for a pending peer
//! join its waiter list instead of starting a second handshake.
//!
//! The pool is single-owner and lock-free. Handshake attempts are futures
//! held in the pool itself; they only make progress when the owner calls
//! `process_next`, so every state change and every callback happens on the
//! owner's task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{abortable, AbortHandle, Aborted, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use trellis_core::{FabricIndex, PeerId, SessionError};

use crate::establish::{AddressResolver, Establishment, SecureChannelEstablisher, SessionHandle};
use crate::resumption::{SessionResumptionCache, DEFAULT_RESUMPTION_CAPACITY};

// ── Callbacks ─────────────────────────────────────────────────────────────────

/// Receives the outcome of a connect request. Exactly one method is called,
/// at most once.
pub trait ConnectionCallback: Send {
    fn on_connected(self: Box<Self>, device: &EstablishedDevice);
    fn on_failure(self: Box<Self>, peer: PeerId, error: &SessionError);
}

type ConnectedFn = Box<dyn FnOnce(&EstablishedDevice) + Send>;
type FailureFn = Box<dyn FnOnce(PeerId, &SessionError) + Send>;

/// Closure-backed callback. Either half may be left out.
#[derive(Default)]
pub struct Callbacks {
    connected: Option<ConnectedFn>,
    failed: Option<FailureFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl FnOnce(&EstablishedDevice) + Send + 'static) -> Self {
        self.connected = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(PeerId, &SessionError) + Send + 'static) -> Self {
        self.failed = Some(Box::new(f));
        self
    }
}

impl ConnectionCallback for Callbacks {
    fn on_connected(self: Box<Self>, device: &EstablishedDevice) {
        if let Some(f) = self.connected {
            f(device);
        }
    }

    fn on_failure(self: Box<Self>, peer: PeerId, error: &SessionError) {
        if let Some(f) = self.failed {
            f(peer, error);
        }
    }
}

/// Identity of one registered waiter, for `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

// ── Devices ───────────────────────────────────────────────────────────────────

/// A peer with a live session. Owned by the pool.
#[derive(Debug)]
pub struct EstablishedDevice {
    peer: PeerId,
    address: SocketAddr,
    session: Arc<dyn SessionHandle>,
    established_at: Instant,
    resumed: bool,
}

impl EstablishedDevice {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn session(&self) -> &Arc<dyn SessionHandle> {
        &self.session
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Whether the session came from resumption rather than a full handshake.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Detached view for callers outside the pool's task.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            peer: self.peer,
            address: self.address,
            session: self.session.clone(),
            resumed: self.resumed,
        }
    }
}

/// Snapshot of an established device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub peer: PeerId,
    pub address: SocketAddr,
    pub session: Arc<dyn SessionHandle>,
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Pending,
    Established,
}

struct Waiter {
    id: WaiterId,
    callback: Box<dyn ConnectionCallback>,
}

struct PendingConnection {
    attempt: u64,
    abort: AbortHandle,
    waiters: Vec<Waiter>,
}

type AttemptResult = Result<(SocketAddr, Establishment), SessionError>;
type AttemptOutcome = (PeerId, u64, Result<AttemptResult, Aborted>);

// ── Pool ──────────────────────────────────────────────────────────────────────

pub struct DeviceSessionPool<const N: usize = DEFAULT_RESUMPTION_CAPACITY> {
    cache: SessionResumptionCache<N>,
    establisher: Arc<dyn SecureChannelEstablisher>,
    resolver: Arc<dyn AddressResolver>,
    pending: HashMap<PeerId, PendingConnection>,
    devices: HashMap<PeerId, EstablishedDevice>,
    in_flight: FuturesUnordered<BoxFuture<'static, AttemptOutcome>>,
    next_attempt: u64,
    next_waiter: u64,
    shut_down: bool,
}

impl<const N: usize> DeviceSessionPool<N> {
    pub fn new(
        cache: SessionResumptionCache<N>,
        establisher: Arc<dyn SecureChannelEstablisher>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            cache,
            establisher,
            resolver,
            pending: HashMap::new(),
            devices: HashMap::new(),
            in_flight: FuturesUnordered::new(),
            next_attempt: 0,
            next_waiter: 0,
            shut_down: false,
        }
    }

    pub fn cache(&self) -> &SessionResumptionCache<N> {
        &self.cache
    }

    /// Connect to `peer`, or join the attempt already under way.
    ///
    /// An already-established peer gets `on_connected` before this returns.
    /// Otherwise the outcome arrives from a later `process_next`. Errors
    /// returned here are synchronous rejections; the callback is not invoked.
    pub fn find_or_initialize_device(
        &mut self,
        peer: PeerId,
        callback: impl ConnectionCallback + 'static,
    ) -> Result<WaiterId, SessionError> {
        if self.shut_down {
            return Err(SessionError::ShutDown);
        }
        if !peer.is_valid() {
            return Err(SessionError::InvalidArgument("peer has undefined fabric or node id"));
        }

        self.next_waiter += 1;
        let id = WaiterId(self.next_waiter);

        if let Some(device) = self.devices.get(&peer) {
            tracing::trace!(peer = %peer, "device already established");
            Box::new(callback).on_connected(device);
            return Ok(id);
        }

        let waiter = Waiter {
            id,
            callback: Box::new(callback),
        };

        if let Some(pending) = self.pending.get_mut(&peer) {
            pending.waiters.push(waiter);
            tracing::debug!(
                peer = %peer,
                waiters = pending.waiters.len(),
                "joined pending connection"
            );
            return Ok(id);
        }

        let (attempt, abort) = self.start_attempt(peer);
        self.pending.insert(
            peer,
            PendingConnection {
                attempt,
                abort,
                waiters: vec![waiter],
            },
        );
        Ok(id)
    }

    fn start_attempt(&mut self, peer: PeerId) -> (u64, AbortHandle) {
        let hint = match self.cache.find_by_peer(peer) {
            Ok(hint) => hint,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "resumption lookup failed, using full handshake");
                None
            }
        };

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let cached_address = self.resolver.cached_address(peer);
        let resolver = self.resolver.clone();
        let establisher = self.establisher.clone();

        tracing::info!(
            peer = %peer,
            attempt,
            resuming = hint.is_some(),
            address_known = cached_address.is_some(),
            "establishing session"
        );

        let (task, abort) = abortable(async move {
            let address = match cached_address {
                Some(address) => address,
                None => resolver.resolve(peer).await?,
            };
            let established = establisher.establish(peer, address, hint).await?;
            Ok::<_, SessionError>((address, established))
        });
        self.in_flight
            .push(Box::pin(async move { (peer, attempt, task.await) }));
        (attempt, abort)
    }

    /// Wait for the next outstanding attempt and deliver its outcome.
    ///
    /// Returns the peer it concerned, or `None` if nothing is in flight.
    pub async fn process_next(&mut self) -> Option<PeerId> {
        let (peer, attempt, outcome) = self.in_flight.next().await?;
        self.complete(peer, attempt, outcome);
        Some(peer)
    }

    /// Drive every outstanding attempt to completion.
    pub async fn run_until_idle(&mut self) {
        while self.process_next().await.is_some() {}
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    fn complete(&mut self, peer: PeerId, attempt: u64, outcome: Result<AttemptResult, Aborted>) {
        let Ok(outcome) = outcome else {
            tracing::debug!(peer = %peer, attempt, "aborted attempt reaped");
            return;
        };
        let current = self.pending.get(&peer).map(|p| p.attempt);
        if current != Some(attempt) {
            tracing::debug!(peer = %peer, attempt, "discarding outcome of abandoned attempt");
            if let Ok((_, established)) = outcome {
                established.session.close();
            }
            return;
        }
        let Some(pending) = self.pending.remove(&peer) else {
            return;
        };

        match outcome {
            Ok((address, established)) => {
                let Establishment {
                    session,
                    resumption_id,
                    secret,
                    tags,
                    resumed,
                } = established;

                if let Err(e) = self.cache.save(peer, resumption_id, &secret, tags) {
                    tracing::warn!(
                        peer = %peer,
                        error = %e,
                        "failed to persist resumption material, continuing without"
                    );
                }

                tracing::info!(
                    peer = %peer,
                    %address,
                    resumed,
                    waiters = pending.waiters.len(),
                    "session established"
                );
                let device = &*self.devices.entry(peer).or_insert(EstablishedDevice {
                    peer,
                    address,
                    session,
                    established_at: Instant::now(),
                    resumed,
                });
                for waiter in pending.waiters {
                    waiter.callback.on_connected(device);
                }
            }
            Err(e) => {
                tracing::warn!(
                    peer = %peer,
                    error = %e,
                    waiters = pending.waiters.len(),
                    "session establishment failed"
                );
                fail_waiters(peer, pending, &e);
            }
        }
    }

    /// Unregister a waiter by identity. The attempt itself carries on.
    pub fn cancel(&mut self, peer: PeerId, id: WaiterId) -> bool {
        let Some(pending) = self.pending.get_mut(&peer) else {
            return false;
        };
        let before = pending.waiters.len();
        pending.waiters.retain(|w| w.id != id);
        before != pending.waiters.len()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Lookup only; never starts a connection.
    pub fn find_existing_device(&self, peer: PeerId) -> Option<&EstablishedDevice> {
        self.devices.get(&peer)
    }

    pub fn peer_state(&self, peer: PeerId) -> PeerState {
        if self.devices.contains_key(&peer) {
            PeerState::Established
        } else if self.pending.contains_key(&peer) {
            PeerState::Pending
        } else {
            PeerState::Idle
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn established_count(&self) -> usize {
        self.devices.len()
    }

    /// Address of the live session, else the discovery cache's best guess.
    pub fn get_peer_address(&self, peer: PeerId) -> Result<SocketAddr, SessionError> {
        if let Some(device) = self.devices.get(&peer) {
            return Ok(device.address);
        }
        self.resolver
            .cached_address(peer)
            .ok_or(SessionError::NotConnected)
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Close and forget the session for `peer`. Resumption material is kept.
    pub fn release_device(&mut self, peer: PeerId) -> bool {
        match self.devices.remove(&peer) {
            Some(device) => {
                device.session.close();
                tracing::info!(peer = %peer, "device released");
                true
            }
            None => false,
        }
    }

    pub fn release_devices_for_fabric(&mut self, fabric: FabricIndex) -> usize {
        let peers: Vec<PeerId> = self
            .devices
            .keys()
            .copied()
            .filter(|p| p.in_fabric(fabric))
            .collect();
        peers.into_iter().filter(|p| self.release_device(*p)).count()
    }

    pub fn release_all_devices(&mut self) -> usize {
        let peers: Vec<PeerId> = self.devices.keys().copied().collect();
        peers.into_iter().filter(|p| self.release_device(*p)).count()
    }

    /// The transport reports the session for `peer` is gone.
    pub fn on_session_failed(&mut self, peer: PeerId) {
        if let Some(device) = self.devices.remove(&peer) {
            device.session.close();
            tracing::info!(peer = %peer, "session lost, device dropped");
        }
    }

    /// A fabric was revoked: drop its sessions, abort its attempts, and
    /// purge its resumption records. Cleanup failures are logged only.
    pub fn on_fabric_removed(&mut self, fabric: FabricIndex) {
        let released = self.release_devices_for_fabric(fabric);

        let abandoned: Vec<PeerId> = self
            .pending
            .keys()
            .copied()
            .filter(|p| p.in_fabric(fabric))
            .collect();
        let error = SessionError::handshake("fabric removed");
        for peer in &abandoned {
            if let Some(pending) = self.pending.remove(peer) {
                pending.abort.abort();
                fail_waiters(*peer, pending, &error);
            }
        }

        if let Err(e) = self.cache.delete_all(fabric) {
            tracing::warn!(fabric = %fabric, error = %e, "failed to purge resumption records");
        }
        tracing::info!(
            fabric = %fabric,
            released,
            abandoned = abandoned.len(),
            "fabric removed"
        );
    }

    /// Release everything and refuse further connects. Pending waiters get
    /// `ShutDown`.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let released = self.release_all_devices();
        let pending: Vec<(PeerId, PendingConnection)> = self.pending.drain().collect();
        let abandoned = pending.len();
        for (peer, pending) in pending {
            pending.abort.abort();
            fail_waiters(peer, pending, &SessionError::ShutDown);
        }
        self.in_flight = FuturesUnordered::new();
        tracing::info!(released, abandoned, "session pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl<const N: usize> Drop for DeviceSessionPool<N> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fail_waiters(peer: PeerId, pending: PendingConnection, error: &SessionError) {
    for waiter in pending.waiters {
        waiter.callback.on_failure(peer, error);
    }
}
