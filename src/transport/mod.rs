//! The seam between the core engine and external transport drivers
//! (spec §6 "TransportAdapter"). Drivers — BLE, WiFi Direct, LAN, WiFi
//! Aware radio plumbing — are out of scope (spec §1); this module only
//! defines the interface the core exposes to them and consumes from them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::peer::{now_ms, PeerRegistry, TransportInfo, TransportKind};
use crate::session::ByteChannel;

/// Opaque handle to an open transport-level connection, returned by
/// [`TransportDriver::connect`] and consumed by [`TransportDriver::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl SessionHandle {
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outbound interface: what the core calls on a transport driver
/// (spec §6 "TransportAdapter (outbound from core)").
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Best-effort send, bounded latency. Returns `false` on failure
    /// rather than erroring — the caller treats it as a transport hiccup,
    /// not a session-ending failure.
    async fn send(&self, kind: TransportKind, address: &str, bytes: Vec<u8>) -> bool;

    async fn connect(&self, kind: TransportKind, address: &str) -> Result<SessionHandle>;

    async fn close(&self, handle: SessionHandle);
}

/// A frame delivered by a driver, queued for the session or scheduler that
/// owns the peer it arrived from.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub kind: TransportKind,
    pub address: String,
    pub bytes: Vec<u8>,
}

/// A driver-accepted inbound connection, handed to whichever exchange
/// session is waiting for it.
#[derive(Debug, Clone)]
pub struct AcceptedSession {
    pub kind: TransportKind,
    pub address: String,
    pub handle: SessionHandle,
}

/// Inbound interface: what transport drivers call into the core
/// (spec §6 "TransportAdapter (inbound to core)"). Peer observations feed
/// the [`PeerRegistry`]; frames and accepted sessions are forwarded over
/// channels to the scheduler/session layer, which owns the actual state
/// machines.
pub struct TransportAdapter {
    registry: std::sync::Arc<PeerRegistry>,
    frame_tx: mpsc::Sender<InboundFrame>,
    accepted_tx: mpsc::Sender<AcceptedSession>,
    /// Routes frames from an address already claimed by an active
    /// [`DriverByteChannel`] straight to that session instead of the
    /// general discovery-phase `frame_tx`. Registered by
    /// [`TransportAdapter::register_session`] once a session takes
    /// ownership of a connection, and removed when the channel is
    /// dropped.
    session_routes: Arc<DashMap<(TransportKind, String), mpsc::Sender<Vec<u8>>>>,
}

impl TransportAdapter {
    pub fn new(
        registry: std::sync::Arc<PeerRegistry>,
    ) -> (Self, mpsc::Receiver<InboundFrame>, mpsc::Receiver<AcceptedSession>) {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (accepted_tx, accepted_rx) = mpsc::channel(64);
        (
            Self {
                registry,
                frame_tx,
                accepted_tx,
                session_routes: Arc::new(DashMap::new()),
            },
            frame_rx,
            accepted_rx,
        )
    }

    /// Claims `(kind, address)` for an exchange session, returning a
    /// [`DriverByteChannel`] that reads inbound bytes routed here instead
    /// of through the general `frame_tx` and writes outbound bytes via
    /// `driver.send()`. The route is torn down when the returned channel
    /// is dropped, so later frames from this address fall back to
    /// `frame_tx` again (e.g. the next session opened against it).
    pub fn register_session(
        &self,
        driver: Arc<dyn TransportDriver>,
        kind: TransportKind,
        address: &str,
    ) -> DriverByteChannel {
        let (tx, rx) = mpsc::channel(64);
        self.session_routes
            .insert((kind, address.to_string()), tx);
        DriverByteChannel {
            driver,
            kind,
            address: address.to_string(),
            inbound: rx,
            buffer: Vec::new(),
            routes: self.session_routes.clone(),
        }
    }

    /// A driver observed a peer, optionally with an advertised identifier
    /// (full `publicId`, 8-hex prefix, or none if the transport can't
    /// carry one).
    pub async fn on_peer_observed(
        &self,
        kind: TransportKind,
        address: &str,
        advertised_id: Option<&str>,
    ) {
        let now = now_ms();
        let observed_id = advertised_id.unwrap_or(address);
        self.registry
            .report(kind, observed_id, TransportInfo::new(address, now), now)
            .await;
    }

    /// A driver delivered raw bytes from an established connection. If a
    /// session has claimed `(kind, address)` via
    /// [`TransportAdapter::register_session`], the bytes go straight to
    /// it; otherwise they fall back to the general `frame_tx` (discovery,
    /// or a frame that raced the session's registration).
    pub async fn on_frame(&self, kind: TransportKind, address: &str, bytes: Vec<u8>) {
        let route = self
            .session_routes
            .get(&(kind, address.to_string()))
            .map(|entry| entry.value().clone());
        if let Some(route) = route {
            if route.send(bytes).await.is_ok() {
                return;
            }
        }
        let _ = self
            .frame_tx
            .send(InboundFrame {
                kind,
                address: address.to_string(),
                bytes,
            })
            .await;
    }

    /// A driver accepted an inbound connection on behalf of the core.
    pub async fn open_session_accepted(
        &self,
        kind: TransportKind,
        address: &str,
        handle: SessionHandle,
    ) {
        let _ = self
            .accepted_tx
            .send(AcceptedSession {
                kind,
                address: address.to_string(),
                handle,
            })
            .await;
    }
}

/// Bridges the message-passing [`TransportDriver`] interface to the
/// stream-oriented [`ByteChannel`] that [`crate::session::legacy`] and
/// [`crate::session::framed`] drive their exchanges over. Reads pull
/// from an `mpsc::Receiver` fed by [`TransportAdapter::on_frame`]; writes
/// go straight out through `driver.send()`.
pub struct DriverByteChannel {
    driver: Arc<dyn TransportDriver>,
    kind: TransportKind,
    address: String,
    inbound: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    routes: Arc<DashMap<(TransportKind, String), mpsc::Sender<Vec<u8>>>>,
}

impl Drop for DriverByteChannel {
    fn drop(&mut self) {
        self.routes.remove(&(self.kind, self.address.clone()));
    }
}

#[async_trait]
impl ByteChannel for DriverByteChannel {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.driver.send(self.kind, &self.address, buf.to_vec()).await {
            Ok(())
        } else {
            Err(Error::TransportUnavailable(self.address.clone()))
        }
    }

    async fn read_exact_or_eof(&mut self, len: usize) -> Result<Option<Vec<u8>>> {
        while self.buffer.len() < len {
            match self.inbound.recv().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::ProtocolError(
                        "channel closed mid-frame".to_string(),
                    ));
                }
            }
        }
        let rest = self.buffer.split_off(len);
        let frame = std::mem::replace(&mut self.buffer, rest);
        Ok(Some(frame))
    }
}
