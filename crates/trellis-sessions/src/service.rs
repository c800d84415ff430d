//! Pool task — runs a `DeviceSessionPool` behind a command channel.
//!
//! The pool itself is single-owner. `PoolService` owns it on one task and
//! multiplexes three event sources: commands from any number of
//! `PoolHandle`s, completions of in-flight handshakes, and the process-wide
//! shutdown broadcast. Handles are cheap to clone and safe to use from any
//! task.

use std::net::SocketAddr;

use tokio::sync::{broadcast, mpsc, oneshot};
use trellis_core::config::PoolConfig;
use trellis_core::{FabricIndex, PeerId, SessionError};

use crate::pool::{ConnectionCallback, DeviceInfo, DeviceSessionPool, EstablishedDevice};
use crate::resumption::DEFAULT_RESUMPTION_CAPACITY;

pub type Reply<T> = oneshot::Sender<T>;

pub enum PoolCommand {
    Connect {
        peer: PeerId,
        reply: Reply<Result<DeviceInfo, SessionError>>,
    },
    FindExisting {
        peer: PeerId,
        reply: Reply<Option<DeviceInfo>>,
    },
    Release {
        peer: PeerId,
        reply: Reply<bool>,
    },
    ReleaseFabric {
        fabric: FabricIndex,
        reply: Reply<usize>,
    },
    ReleaseAll {
        reply: Reply<usize>,
    },
    FabricRemoved {
        fabric: FabricIndex,
        reply: Reply<()>,
    },
    SessionFailed {
        peer: PeerId,
    },
    PeerAddress {
        peer: PeerId,
        reply: Reply<Result<SocketAddr, SessionError>>,
    },
}

impl ConnectionCallback for oneshot::Sender<Result<DeviceInfo, SessionError>> {
    fn on_connected(self: Box<Self>, device: &EstablishedDevice) {
        let _ = (*self).send(Ok(device.info()));
    }

    fn on_failure(self: Box<Self>, _peer: PeerId, error: &SessionError) {
        let _ = (*self).send(Err(error.clone()));
    }
}

pub struct PoolService<const N: usize = DEFAULT_RESUMPTION_CAPACITY> {
    pool: DeviceSessionPool<N>,
    commands: mpsc::Receiver<PoolCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl<const N: usize> PoolService<N> {
    pub fn new(
        pool: DeviceSessionPool<N>,
        config: &PoolConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, PoolHandle) {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let service = Self {
            pool,
            commands: rx,
            shutdown,
        };
        (service, PoolHandle { commands: tx })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session pool shutting down");
                    self.pool.shutdown();
                    return Ok(());
                }

                Some(peer) = self.pool.process_next(), if self.pool.has_in_flight() => {
                    tracing::trace!(peer = %peer, "attempt completed");
                }

                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::info!("all pool handles dropped, session pool exiting");
                        self.pool.shutdown();
                        return Ok(());
                    };
                    self.handle(cmd);
                }
            }
        }
    }

    fn handle(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Connect { peer, reply } => {
                if !peer.is_valid() {
                    let _ = reply.send(Err(SessionError::InvalidArgument(
                        "peer has undefined fabric or node id",
                    )));
                    return;
                }
                // Remaining rejection is shutdown; the dropped reply reports it.
                if let Err(e) = self.pool.find_or_initialize_device(peer, reply) {
                    tracing::debug!(peer = %peer, error = %e, "connect rejected");
                }
            }
            PoolCommand::FindExisting { peer, reply } => {
                let _ = reply.send(self.pool.find_existing_device(peer).map(EstablishedDevice::info));
            }
            PoolCommand::Release { peer, reply } => {
                let _ = reply.send(self.pool.release_device(peer));
            }
            PoolCommand::ReleaseFabric { fabric, reply } => {
                let _ = reply.send(self.pool.release_devices_for_fabric(fabric));
            }
            PoolCommand::ReleaseAll { reply } => {
                let _ = reply.send(self.pool.release_all_devices());
            }
            PoolCommand::FabricRemoved { fabric, reply } => {
                self.pool.on_fabric_removed(fabric);
                let _ = reply.send(());
            }
            PoolCommand::SessionFailed { peer } => {
                self.pool.on_session_failed(peer);
            }
            PoolCommand::PeerAddress { peer, reply } => {
                let _ = reply.send(self.pool.get_peer_address(peer));
            }
        }
    }
}

/// Client side of the pool task. A closed task reports `ShutDown`.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> PoolCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::ShutDown)?;
        rx.await.map_err(|_| SessionError::ShutDown)
    }

    /// Connect to `peer`, sharing any attempt already in progress.
    pub async fn connect(&self, peer: PeerId) -> Result<DeviceInfo, SessionError> {
        self.request(|reply| PoolCommand::Connect { peer, reply }).await?
    }

    pub async fn find_existing(&self, peer: PeerId) -> Result<Option<DeviceInfo>, SessionError> {
        self.request(|reply| PoolCommand::FindExisting { peer, reply }).await
    }

    pub async fn release(&self, peer: PeerId) -> Result<bool, SessionError> {
        self.request(|reply| PoolCommand::Release { peer, reply }).await
    }

    pub async fn release_fabric(&self, fabric: FabricIndex) -> Result<usize, SessionError> {
        self.request(|reply| PoolCommand::ReleaseFabric { fabric, reply }).await
    }

    pub async fn release_all(&self) -> Result<usize, SessionError> {
        self.request(|reply| PoolCommand::ReleaseAll { reply }).await
    }

    /// Returns once the fabric's sessions and records are gone.
    pub async fn fabric_removed(&self, fabric: FabricIndex) -> Result<(), SessionError> {
        self.request(|reply| PoolCommand::FabricRemoved { fabric, reply }).await
    }

    pub async fn session_failed(&self, peer: PeerId) -> Result<(), SessionError> {
        self.commands
            .send(PoolCommand::SessionFailed { peer })
            .await
            .map_err(|_| SessionError::ShutDown)
    }

    pub async fn peer_address(&self, peer: PeerId) -> Result<SocketAddr, SessionError> {
        self.request(|reply| PoolCommand::PeerAddress { peer, reply }).await?
    }
}
