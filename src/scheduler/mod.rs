//! Per-peer backoff, concurrency cap, and transport selection (spec §4.5
//! "Scheduler").
//!
//! Drives one exchange per peer at a time, globally bounded by
//! `MAX_CONCURRENT_EXCHANGES`. The scheduler owns peer backoff state and
//! decides *when* and *over which transport* to exchange; it does not
//! itself speak either wire protocol — that's [`crate::session::legacy`]
//! or [`crate::session::framed`], dispatched by [`exchange_kind_for`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::friend::FriendId;
use crate::message::MessageStore;
use crate::peer::{now_ms, PeerRegistry, TransportKind};
use crate::session::legacy::{run_legacy_exchange, LegacyPolicy};
use crate::session::framed::run_framed_exchange;
use crate::session::{ByteChannel, ExchangeOutcome};
use crate::transport::{TransportAdapter, TransportDriver};

/// Which wire protocol a transport kind is driven over (spec §4.5 step 3:
/// "legacy for BLE; framed for WiFi Aware; transport-specific TCP
/// sub-channel for WiFi Direct and LAN using the framed protocol").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Legacy,
    Framed,
}

pub fn exchange_kind_for(transport: TransportKind) -> ExchangeKind {
    match transport {
        TransportKind::Ble => ExchangeKind::Legacy,
        TransportKind::WifiAware | TransportKind::WifiDirect | TransportKind::Lan => {
            ExchangeKind::Framed
        }
    }
}

/// How the last exchange with a peer concluded, used only for
/// diagnostics — backoff itself only distinguishes success/failure
/// (spec §4.5 "On success" / "On failure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastResult {
    Unknown,
    Success,
    Failed,
}

/// Per-`publicId` retry state (spec §3 "PeerBackoff").
#[derive(Debug, Clone)]
pub struct PeerBackoff {
    pub attempts: u32,
    pub last_exchange_ms: Option<u64>,
    pub last_result: LastResult,
}

impl Default for PeerBackoff {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_exchange_ms: None,
            last_result: LastResult::Unknown,
        }
    }
}

/// `delay(a) = min(base * 2^a, max)`, `delay(a<0) = base` (spec §4.5,
/// §8 "Backoff series").  `attempts` is unsigned so the `a<0` case
/// collapses to `attempts == 0` — both mean "no prior exchange",
/// intentionally sharing a code path.
pub fn delay(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let scaled = base_ms.saturating_mul(1u64 << attempts.min(63));
    scaled.min(max_ms)
}

impl PeerBackoff {
    fn ready(&self, now: u64, base_ms: u64, max_ms: u64) -> bool {
        match self.last_exchange_ms {
            None => true,
            Some(last) => now.saturating_sub(last) >= delay(self.attempts, base_ms, max_ms),
        }
    }

    fn record_success(&mut self, now: u64) {
        self.attempts = 0;
        self.last_exchange_ms = Some(now);
        self.last_result = LastResult::Success;
    }

    fn record_failure(&mut self, now: u64, saturating_cap: u32) {
        self.attempts = (self.attempts + 1).min(saturating_cap);
        self.last_exchange_ms = Some(now);
        self.last_result = LastResult::Failed;
    }
}

/// Compares two peer identifiers in the shorter of the two known forms
/// (spec §4.5 point 4, §9 "standardise on compare in the shorter form").
/// Returns true if `own_id` should act as initiator.
pub fn is_initiator(own_id: &str, peer_id: &str) -> bool {
    let len = own_id.len().min(peer_id.len());
    own_id[..len] < peer_id[..len]
}

/// Global resource limits (spec §5 "Mutual exclusion").
pub struct SchedulerLimits {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_concurrent_exchanges: usize,
}

/// Backoff tracking plus the concurrency gate shared across all active
/// exchanges. One instance per process.
pub struct Scheduler {
    backoff: DashMap<String, PeerBackoff>,
    permits: Arc<Semaphore>,
    limits: SchedulerLimits,
}

impl Scheduler {
    pub fn new(limits: SchedulerLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent_exchanges));
        Self {
            backoff: DashMap::new(),
            permits,
            limits,
        }
    }

    /// Non-stale peer/transport pairs that are both off cooldown and not
    /// already holding an active session, ordered by the registry's
    /// transport priority (spec §4.3 `candidates_for_exchange`, §4.5
    /// step 2).
    pub async fn ready_candidates(
        &self,
        registry: &PeerRegistry,
        now: u64,
    ) -> Vec<(String, TransportKind)> {
        registry
            .candidates_for_exchange(now)
            .await
            .into_iter()
            .filter(|(public_id, _)| {
                self.backoff
                    .entry(public_id.clone())
                    .or_default()
                    .ready(now, self.limits.backoff_base_ms, self.limits.backoff_max_ms)
            })
            .collect()
    }

    pub fn record_success(&self, public_id: &str, now: u64) {
        self.backoff.entry(public_id.to_string()).or_default().record_success(now);
    }

    pub fn record_failure(&self, public_id: &str, now: u64) {
        self.backoff
            .entry(public_id.to_string())
            .or_default()
            .record_failure(now, u32::MAX);
    }

    pub fn backoff_of(&self, public_id: &str) -> PeerBackoff {
        self.backoff.entry(public_id.to_string()).or_default().clone()
    }

    /// Acquire a global exchange slot (spec §5 "at most
    /// `MAX_CONCURRENT_EXCHANGES` sessions globally"). Dropping the
    /// returned permit releases the slot, including on cancellation
    /// (spec §5 "Suspension points").
    pub async fn acquire_slot(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    /// Runs one full pass of spec §4.5's scheduler loop: prune the
    /// registry, pick ready (peer, transport) candidates, decide the
    /// initiator side via [`is_initiator`], open a connection through
    /// `driver`, and drive the exchange protocol [`exchange_kind_for`]
    /// that transport calls for. Candidates are driven one at a time,
    /// each behind an acquired concurrency slot; a candidate whose peer
    /// record or transport address vanished between `ready_candidates`
    /// and dispatch (e.g. pruned by a concurrent caller) is skipped
    /// rather than treated as a failure. Returns one outcome per
    /// candidate actually attempted.
    pub async fn run_once(
        &self,
        registry: &PeerRegistry,
        driver: &Arc<dyn TransportDriver>,
        adapter: &TransportAdapter,
        own_public_id: &str,
        ctx: &ExchangeContext<'_>,
    ) -> Vec<(String, Result<ExchangeOutcome>)> {
        let now = now_ms();
        registry.prune(now).await;

        let mut results = Vec::new();
        for (public_id, kind) in self.ready_candidates(registry, now).await {
            let Some(peer) = registry.get(&public_id).await else {
                continue;
            };
            let Some(address) = peer.transports.get(&kind).map(|info| info.address.clone()) else {
                continue;
            };

            let _permit = self.acquire_slot().await;
            let initiator = is_initiator(own_public_id, &public_id);

            let handle = match driver.connect(kind, &address).await {
                Ok(handle) => handle,
                Err(err) => {
                    self.record_failure(&public_id, now);
                    results.push((public_id, Err(err)));
                    continue;
                }
            };

            let mut channel = adapter.register_session(driver.clone(), kind, &address);
            let outcome = drive_exchange(
                self,
                &public_id,
                exchange_kind_for(kind),
                initiator,
                &mut channel,
                ctx,
            )
            .await;
            driver.close(handle).await;

            results.push((public_id, outcome));
        }
        results
    }
}

/// Everything an exchange needs besides the already-open channel and
/// already-acquired concurrency slot. Bundled so the scheduler's
/// dispatch call site stays small.
pub struct ExchangeContext<'a> {
    pub own_friends: &'a [FriendId],
    pub message_store: &'a MessageStore,
    pub legacy_policy: &'a LegacyPolicy,
    pub local_public_id_prefix: &'a str,
}

/// Runs the exchange appropriate to `kind` over an already-open channel
/// and reports the outcome back into the scheduler's backoff table
/// (spec §4.5 "On success" / "On failure", §7 "per-session failures ...
/// update backoff").
pub async fn drive_exchange(
    scheduler: &Scheduler,
    public_id: &str,
    kind: ExchangeKind,
    initiator: bool,
    channel: &mut dyn ByteChannel,
    ctx: &ExchangeContext<'_>,
) -> Result<ExchangeOutcome> {
    let now = now_ms();
    let result = match kind {
        ExchangeKind::Legacy => {
            run_legacy_exchange(
                channel,
                initiator,
                ctx.own_friends,
                ctx.message_store,
                ctx.legacy_policy,
            )
            .await
        }
        ExchangeKind::Framed => {
            let candidates = ctx
                .message_store
                .candidates_for_exchange(0, ctx.legacy_policy.max_messages_per_exchange)
                .await
                .unwrap_or_default();
            run_framed_exchange(
                channel,
                initiator,
                ctx.local_public_id_prefix,
                candidates,
                ctx.message_store,
            )
            .await
        }
    };

    match &result {
        Ok(_) => scheduler.record_success(public_id, now),
        Err(err) if err.category().counts_against_peer() => {
            scheduler.record_failure(public_id, now)
        }
        Err(_) => {}
    }
    result
}
