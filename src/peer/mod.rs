//! Cross-transport peer correlation and eviction (spec §3 "UnifiedPeer",
//! "TransportInfo", §4.3 "PeerRegistry").

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::identity::PREFIX_LEN;

/// The four transport kinds a peer may be observed on (spec §3 invariant a).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Ble,
    WifiDirect,
    Lan,
    WifiAware,
}

impl TransportKind {
    /// Scheduler transport priority: higher first (spec §4.3
    /// `candidates_for_exchange`, §4.5 step 2).
    fn priority(self) -> u8 {
        match self {
            TransportKind::WifiDirect => 3,
            TransportKind::Lan => 2,
            TransportKind::WifiAware => 1,
            TransportKind::Ble => 0,
        }
    }
}

/// Transport-specific connection details (spec §3 "TransportInfo").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportInfo {
    /// Address in whatever form the transport uses: BLE address, WiFi
    /// Direct MAC, LAN `host:port`, or a serialized WiFi-Aware `PeerHandle`.
    pub address: String,
    pub last_seen: u64,
    pub signal_strength: Option<i32>,
    pub service_port: Option<u16>,
}

impl TransportInfo {
    pub fn new(address: impl Into<String>, now: u64) -> Self {
        Self {
            address: address.into(),
            last_seen: now,
            signal_strength: None,
            service_port: None,
        }
    }

    fn is_stale(&self, now: u64, stale_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > stale_ms
    }
}

/// A peer correlated across one or more transports (spec §3 "UnifiedPeer").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedPeer {
    /// Full `publicId` (64 hex chars) once known, or an 8-char prefix
    /// before the handshake completes.
    pub public_id: String,
    pub transports: HashMap<TransportKind, TransportInfo>,
    pub first_seen: u64,
    pub last_activity: u64,
    pub handshake_completed: bool,
}

impl UnifiedPeer {
    fn new(public_id: String, now: u64) -> Self {
        Self {
            public_id,
            transports: HashMap::new(),
            first_seen: now,
            last_activity: now,
            handshake_completed: false,
        }
    }

    fn recompute_last_activity(&mut self) {
        self.last_activity = self
            .transports
            .values()
            .map(|t| t.last_seen)
            .max()
            .unwrap_or(self.last_activity);
    }

    /// True if `public_id` is a short (8-hex) tentative identifier rather
    /// than the full 64-char form.
    pub fn is_tentative(&self) -> bool {
        self.public_id.len() == PREFIX_LEN
    }
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct RegistryState {
    peers: HashMap<String, UnifiedPeer>,
    /// (kind, address) -> owning peer's public_id, for O(1) collision
    /// detection (spec §4.3 rule 3).
    transport_index: HashMap<(TransportKind, String), String>,
}

/// Cross-transport peer correlation table (spec §4.3).
pub struct PeerRegistry {
    state: RwLock<RegistryState>,
    stale_ms: u64,
}

impl PeerRegistry {
    pub fn new(stale_ms: u64) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                peers: HashMap::new(),
                transport_index: HashMap::new(),
            }),
            stale_ms,
        }
    }

    /// Report an observation of `observed_id` on `transport_kind` at `now`
    /// (spec §4.3 `report`). `observed_id` may be a full `publicId`, an
    /// 8-hex prefix, or a transport-native address awaiting handshake.
    pub async fn report(
        &self,
        transport_kind: TransportKind,
        observed_id: &str,
        mut info: TransportInfo,
        now: u64,
    ) {
        info.last_seen = now;
        let mut state = self.state.write().await;

        // Rule 1: exact publicId match.
        let resolved_id = if state.peers.contains_key(observed_id) {
            observed_id.to_string()
        } else if observed_id.len() == PREFIX_LEN
            && observed_id.chars().all(|c| c.is_ascii_hexdigit())
        {
            // Rule 2: prefix match, only if exactly one peer's publicId
            // (or tentative prefix) starts with it.
            let matches: Vec<&String> = state
                .peers
                .keys()
                .filter(|id| id.starts_with(observed_id))
                .collect();
            match matches.as_slice() {
                [single] => single.to_string(),
                _ => observed_id.to_string(),
            }
        } else {
            observed_id.to_string()
        };

        // Rule 3: transport-key collision.
        let key = (transport_kind, info.address.clone());
        if let Some(existing_owner) = state.transport_index.get(&key).cloned() {
            if existing_owner != resolved_id {
                Self::detach_transport(&mut state, &existing_owner, transport_kind);
            }
        }

        // Rule 4 (or continuation of 1/2): attach to the resolved peer,
        // creating it if necessary.
        let peer = state
            .peers
            .entry(resolved_id.clone())
            .or_insert_with(|| UnifiedPeer::new(resolved_id.clone(), now));
        peer.transports.insert(transport_kind, info);
        peer.recompute_last_activity();

        state.transport_index.insert(key, resolved_id);
    }

    fn detach_transport(state: &mut RegistryState, owner: &str, kind: TransportKind) {
        let mut delete_owner = false;
        if let Some(peer) = state.peers.get_mut(owner) {
            peer.transports.remove(&kind);
            if peer.transports.is_empty() {
                delete_owner = true;
            } else {
                peer.recompute_last_activity();
            }
        }
        if delete_owner {
            state.peers.remove(owner);
        }
        state
            .transport_index
            .retain(|(k, _), v| !(*k == kind && v == owner));
    }

    /// Replace a tentative-prefix peer record with its full `publicId`
    /// after handshake completes, merging transports (spec §4.3 `promote`).
    pub async fn promote(&self, tentative_id: &str, full_public_id: &str) {
        let mut state = self.state.write().await;
        let Some(mut tentative) = state.peers.remove(tentative_id) else {
            return;
        };
        tentative.handshake_completed = true;

        for (kind, info) in &tentative.transports {
            state
                .transport_index
                .insert((*kind, info.address.clone()), full_public_id.to_string());
        }

        match state.peers.get_mut(full_public_id) {
            Some(existing) => {
                for (kind, info) in tentative.transports {
                    existing.transports.insert(kind, info);
                }
                existing.handshake_completed = true;
                existing.first_seen = existing.first_seen.min(tentative.first_seen);
                existing.recompute_last_activity();
            }
            None => {
                tentative.public_id = full_public_id.to_string();
                state.peers.insert(full_public_id.to_string(), tentative);
            }
        }
    }

    /// Remove stale transports and peers left with zero transports
    /// (spec §4.3 `prune`).
    pub async fn prune(&self, now: u64) {
        let mut state = self.state.write().await;
        let stale_ms = self.stale_ms;

        let mut to_delete = Vec::new();
        for (id, peer) in state.peers.iter_mut() {
            peer.transports
                .retain(|_, info| !info.is_stale(now, stale_ms));
            if peer.transports.is_empty() {
                to_delete.push(id.clone());
            } else {
                peer.recompute_last_activity();
            }
        }
        for id in &to_delete {
            state.peers.remove(id);
        }
        state.transport_index.retain(|_, owner| !to_delete.contains(owner));
    }

    /// Non-stale peers with at least one live transport, paired with their
    /// highest-priority non-stale transport, ordered by that transport's
    /// priority descending (spec §4.3 `candidates_for_exchange`,
    /// §4.5 step 2: WIFI_DIRECT > LAN > WIFI_AWARE > BLE).
    pub async fn candidates_for_exchange(&self, now: u64) -> Vec<(String, TransportKind)> {
        let state = self.state.read().await;
        let mut out: Vec<(String, TransportKind)> = state
            .peers
            .values()
            .filter_map(|peer| {
                peer.transports
                    .iter()
                    .filter(|(_, info)| !info.is_stale(now, self.stale_ms))
                    .max_by_key(|(kind, _)| kind.priority())
                    .map(|(kind, _)| (peer.public_id.clone(), *kind))
            })
            .collect();
        out.sort_by(|a, b| b.1.priority().cmp(&a.1.priority()));
        out
    }

    pub async fn get(&self, public_id: &str) -> Option<UnifiedPeer> {
        self.state.read().await.peers.get(public_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.peers.len()
    }
}
