//! Four-phase length-prefixed dialogue (spec §4.6 "LegacyExchange").
//!
//! Wire unit: a 32-bit big-endian length followed by a UTF-8 JSON
//! payload. Four phases, each a request/response frame pair: Friends,
//! Server reply, Exchange info, Message rounds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::{psi_reply, ClientPsi, ServerReply};
use crate::error::{Error, Result};
use crate::friend::FriendId;
use crate::message::{Message, MessageStore};
use crate::session::{ByteChannel, ExchangeOutcome};
use crate::trust::new_priority;

/// Policy inputs the driver needs from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct LegacyPolicy {
    pub use_trust: bool,
    pub min_shared_contacts: u32,
    pub max_messages_per_exchange: u32,
    pub session_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct FriendsPayload {
    msgs: Vec<Value>,
    blinded: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerReplyPayload {
    double: Vec<String>,
    hashed: Vec<String>,
}

impl From<&ServerReply> for ServerReplyPayload {
    fn from(reply: &ServerReply) -> Self {
        Self {
            double: reply.double_blinded.iter().map(base64_encode).collect(),
            hashed: reply.hashed_blinded.iter().map(base64_encode).collect(),
        }
    }
}

impl ServerReplyPayload {
    fn into_reply(self) -> Result<ServerReply> {
        Ok(ServerReply {
            double_blinded: self
                .double
                .iter()
                .map(|s| base64_decode(s))
                .collect::<Result<_>>()?,
            hashed_blinded: self
                .hashed
                .iter()
                .map(|s| base64_decode(s))
                .collect::<Result<_>>()?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CountPayload {
    count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireMessage {
    #[serde(rename = "messageId")]
    message_id: Uuid,
    text: String,
    timestamp: u64,
    #[serde(rename = "hopCount")]
    hop_count: u32,
    priority: u8,
    #[serde(rename = "trustScore")]
    trust_score: f64,
    #[serde(rename = "sharedFriends")]
    shared_friends: u32,
    #[serde(rename = "senderFriends")]
    sender_friends: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageRoundPayload {
    msgs: Vec<WireMessage>,
    blinded: Vec<String>,
}

fn base64_encode(bytes: &Vec<u8>) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::ProtocolError(format!("malformed base64: {e}")))
}

async fn write_json_frame(channel: &mut dyn ByteChannel, value: &impl Serialize) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::ProtocolError("frame payload too large".into()))?;
    channel.write_all(&len.to_be_bytes()).await?;
    channel.write_all(&payload).await
}

/// Reads one length-prefixed JSON frame. `Ok(None)` means the phase ended
/// cleanly (spec §4.6 "Any frame read returning nothing ends the phase").
async fn read_json_frame<T: serde::de::DeserializeOwned>(
    channel: &mut dyn ByteChannel,
) -> Result<Option<T>> {
    let Some(len_bytes) = channel.read_exact_or_eof(4).await? else {
        return Ok(None);
    };
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    let Some(payload) = channel.read_exact_or_eof(len).await? else {
        return Err(Error::ProtocolError(
            "legacy frame closed mid-payload".into(),
        ));
    };
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Drives one full legacy exchange session to completion or to an early
/// abort (spec §4.6 policy gate: `INSUFFICIENT_TRUST`).
///
/// `initiator` breaks the otherwise-symmetric send/receive ordering: the
/// initiator writes each phase's frame before reading the peer's, the
/// responder the reverse, so neither side blocks forever waiting to read
/// first (spec §4.5 point 4 governs which side is the initiator).
pub async fn run_legacy_exchange(
    channel: &mut dyn ByteChannel,
    initiator: bool,
    own_friends: &[FriendId],
    message_store: &MessageStore,
    policy: &LegacyPolicy,
) -> Result<ExchangeOutcome> {
    tokio::time::timeout(
        policy.session_timeout,
        run_legacy_exchange_inner(channel, initiator, own_friends, message_store, policy),
    )
    .await
    .map_err(|_| Error::Timeout("legacy exchange session".into()))?
}

async fn run_legacy_exchange_inner(
    channel: &mut dyn ByteChannel,
    initiator: bool,
    own_friends: &[FriendId],
    message_store: &MessageStore,
    policy: &LegacyPolicy,
) -> Result<ExchangeOutcome> {
    // Phase 1: Friends.
    let client_psi = ClientPsi::new(own_friends.iter().map(FriendId::as_str));
    let own_blinded = if policy.use_trust {
        client_psi.encode_blinded_items()
    } else {
        Vec::new()
    };
    let own_friends_frame = FriendsPayload {
        msgs: Vec::new(),
        blinded: own_blinded.iter().map(base64_encode).collect(),
    };

    let peer_friends_frame: FriendsPayload =
        match exchange_frame(channel, initiator, &own_friends_frame).await? {
            Some(frame) => frame,
            None => {
                return Ok(ExchangeOutcome {
                    common_friends: 0,
                    messages_sent: 0,
                    messages_received: 0,
                })
            }
        };
    let peer_blinded: Vec<Vec<u8>> = peer_friends_frame
        .blinded
        .iter()
        .map(|s| base64_decode(s))
        .collect::<Result<_>>()?;

    // Phase 2: Server reply. Each side acts as the PSI "server" for the
    // other's blinded set using its own friend list.
    let common_friends = if policy.use_trust {
        let own_reply = psi_reply(own_friends.iter().map(FriendId::as_str), &peer_blinded)?;
        let own_reply_frame = ServerReplyPayload::from(&own_reply);

        let peer_reply_frame: ServerReplyPayload =
            match exchange_frame(channel, initiator, &own_reply_frame).await? {
                Some(frame) => frame,
                None => {
                    return Ok(ExchangeOutcome {
                        common_friends: 0,
                        messages_sent: 0,
                        messages_received: 0,
                    })
                }
            };
        client_psi.get_cardinality(&peer_reply_frame.into_reply()?)?
    } else {
        0
    };

    if policy.use_trust && common_friends < policy.min_shared_contacts {
        return Err(Error::PeerRejected {
            common_friends,
            required: policy.min_shared_contacts,
        });
    }

    // Phase 3: Exchange info.
    let candidates = message_store
        .candidates_for_exchange(common_friends, policy.max_messages_per_exchange)
        .await?;
    let own_count = candidates.len() as u32;
    let own_count_frame = CountPayload { count: own_count };

    let peer_count_frame: CountPayload =
        match exchange_frame(channel, initiator, &own_count_frame).await? {
            Some(frame) => frame,
            None => {
                return Ok(ExchangeOutcome {
                    common_friends,
                    messages_sent: 0,
                    messages_received: 0,
                })
            }
        };

    let rounds = own_count.max(peer_count_frame.count.min(policy.max_messages_per_exchange));

    // Phase 4: Message rounds. Each side emits at most one message per
    // round (spec §4.6 step 4).
    let own_friend_count = own_friends.len() as u32;
    let mut messages_sent = 0u32;
    let mut messages_received = 0u32;
    for round in 0..rounds {
        let outgoing = candidates.get(round as usize);
        let round_frame = MessageRoundPayload {
            msgs: outgoing
                .map(|msg| WireMessage {
                    message_id: msg.message_id,
                    text: msg.text.clone(),
                    timestamp: msg.timestamp,
                    hop_count: msg.hop_count,
                    priority: msg.priority,
                    trust_score: msg.trust_score,
                    shared_friends: common_friends,
                    sender_friends: own_friend_count,
                })
                .into_iter()
                .collect(),
            blinded: Vec::new(),
        };
        if outgoing.is_some() {
            messages_sent += 1;
        }

        let peer_round: Option<MessageRoundPayload> =
            exchange_frame(channel, initiator, &round_frame).await?;
        let Some(peer_round) = peer_round else {
            break;
        };

        for wire_msg in peer_round.msgs {
            if merge_message(message_store, wire_msg).await? {
                messages_received += 1;
            }
        }
    }

    Ok(ExchangeOutcome {
        common_friends,
        messages_sent,
        messages_received,
    })
}

/// Merge rule (spec §4.6): if already present, apply `update_trust` with
/// the recomputed `new_priority`; else insert only if `text` is
/// non-empty.
async fn merge_message(message_store: &MessageStore, wire_msg: WireMessage) -> Result<bool> {
    if let Some(existing) = message_store.get(wire_msg.message_id).await? {
        let recomputed = new_priority(
            wire_msg.trust_score,
            existing.trust_score,
            wire_msg.shared_friends,
            wire_msg.sender_friends,
        );
        message_store
            .update_trust(wire_msg.message_id, recomputed)
            .await?;
        return Ok(false);
    }

    if wire_msg.text.is_empty() {
        return Ok(false);
    }

    let trust_score = new_priority(
        wire_msg.trust_score,
        0.0,
        wire_msg.shared_friends,
        wire_msg.sender_friends,
    );
    message_store
        .insert(Message {
            message_id: wire_msg.message_id,
            text: wire_msg.text,
            timestamp: wire_msg.timestamp,
            hop_count: wire_msg.hop_count + 1,
            priority: wire_msg.priority,
            trust_score,
        })
        .await?;
    Ok(true)
}

/// Initiator writes then reads; responder reads then writes — keeps the
/// two sides from both blocking on a read first.
async fn exchange_frame<T>(
    channel: &mut dyn ByteChannel,
    initiator: bool,
    own: &T,
) -> Result<Option<T>>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    if initiator {
        write_json_frame(channel, own).await?;
        read_json_frame(channel).await
    } else {
        let peer = read_json_frame(channel).await?;
        write_json_frame(channel, own).await?;
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::friend::normalize;
    use crate::session::test_support::duplex_pair;

    fn policy(use_trust: bool, min_shared: u32) -> LegacyPolicy {
        LegacyPolicy {
            use_trust,
            min_shared_contacts: min_shared,
            max_messages_per_exchange: 100,
            session_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn trust_disabled_exchanges_messages_without_psi() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        store_a
            .insert(Message::new("hello from a", 1, 1).unwrap())
            .await
            .unwrap();

        let policy_a = policy(false, 0);
        let policy_b = policy(false, 0);
        let (res_a, res_b) = tokio::join!(
            run_legacy_exchange(&mut a, true, &[], &store_a, &policy_a),
            run_legacy_exchange(&mut b, false, &[], &store_b, &policy_b),
        );
        let res_a = res_a.unwrap();
        let res_b = res_b.unwrap();
        assert_eq!(res_a.messages_sent, 1);
        assert_eq!(res_b.messages_received, 1);
    }

    #[tokio::test]
    async fn insufficient_trust_aborts_before_message_rounds() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();

        let friends_a = vec![normalize("5551112222", "US").unwrap()];
        let friends_b = vec![normalize("5553334444", "US").unwrap()];

        let policy_strict = policy(true, 1);
        let (res_a, res_b) = tokio::join!(
            run_legacy_exchange(&mut a, true, &friends_a, &store_a, &policy_strict),
            run_legacy_exchange(&mut b, false, &friends_b, &store_b, &policy_strict),
        );
        assert!(matches!(res_a, Err(Error::PeerRejected { common_friends: 0, .. })));
        assert!(matches!(res_b, Err(Error::PeerRejected { common_friends: 0, .. })));
    }

    #[tokio::test]
    async fn shared_friends_pass_trust_gate_and_merge_messages() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        store_b
            .insert(Message::new("hello from b", 1, 1).unwrap())
            .await
            .unwrap();

        let shared = normalize("5551112222", "US").unwrap();
        let friends_a = vec![shared.clone()];
        let friends_b = vec![shared];

        let policy_loose = policy(true, 1);
        let (res_a, res_b) = tokio::join!(
            run_legacy_exchange(&mut a, true, &friends_a, &store_a, &policy_loose),
            run_legacy_exchange(&mut b, false, &friends_b, &store_b, &policy_loose),
        );
        let res_a = res_a.unwrap();
        let res_b = res_b.unwrap();
        assert_eq!(res_a.common_friends, 1);
        assert_eq!(res_b.common_friends, 1);
        assert_eq!(res_a.messages_received, 1);
    }
}
