//! Typed, ACKed, binary-framed exchange protocol (spec §4.7
//! "FramedExchange").
//!
//! `HELLO`/`HELLO_ACK`/`MESSAGE`/`MESSAGE_ACK`/`DONE`/`ERROR` frames over
//! an ordered byte channel (WiFi Aware, or a TCP sub-channel for WiFi
//! Direct / LAN per spec §4.5 step 3). Unlike the legacy dialogue, this
//! protocol dedups by `message_hash` rather than `messageId` (spec §9
//! open question: "the framed protocol is the newer authority").

use std::collections::HashSet;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::message::{Message, MessageStore};
use crate::session::{ByteChannel, ExchangeOutcome};

/// Wire-compatible protocol version. A mismatch fails the handshake
/// (spec §4.7 "Protocol-version mismatch → ERROR → FAILED").
pub const PROTOCOL_VERSION: u8 = 1;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const MESSAGE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const MAX_RETRIES: u32 = 3;
pub const MAX_BATCH_SIZE: u8 = 10;

const PREFIX_LEN: usize = 8;
const HEADER_LEN: usize = 1 + 4 + 2;
const HELLO_PAYLOAD_LEN: usize = 1 + PREFIX_LEN + 2 + 1;
const MESSAGE_ACK_PAYLOAD_LEN: usize = 4 + 2;
const MESSAGE_HEADER_LEN: usize = 2 + 2 + 32 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Hello,
    HelloAck,
    Message,
    MessageAck,
    Done,
    Error,
}

impl FrameType {
    fn to_u8(self) -> u8 {
        match self {
            FrameType::Hello => 0,
            FrameType::HelloAck => 1,
            FrameType::Message => 2,
            FrameType::MessageAck => 3,
            FrameType::Done => 4,
            FrameType::Error => 5,
        }
    }

    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(FrameType::Hello),
            1 => Ok(FrameType::HelloAck),
            2 => Ok(FrameType::Message),
            3 => Ok(FrameType::MessageAck),
            4 => Ok(FrameType::Done),
            5 => Ok(FrameType::Error),
            other => Err(Error::ProtocolError(format!("unknown frame type {other}"))),
        }
    }
}

struct Frame {
    frame_type: FrameType,
    sequence: u32,
    payload: Vec<u8>,
}

async fn write_frame(channel: &mut dyn ByteChannel, frame_type: FrameType, sequence: u32, payload: &[u8]) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = frame_type.to_u8();
    BigEndian::write_u32(&mut header[1..5], sequence);
    let len = u16::try_from(payload.len())
        .map_err(|_| Error::ProtocolError("framed payload exceeds u16".into()))?;
    BigEndian::write_u16(&mut header[5..7], len);
    channel.write_all(&header).await?;
    if !payload.is_empty() {
        channel.write_all(payload).await?;
    }
    Ok(())
}

/// `Ok(None)` means the channel closed cleanly between frames.
async fn read_frame(channel: &mut dyn ByteChannel) -> Result<Option<Frame>> {
    let Some(header) = channel.read_exact_or_eof(HEADER_LEN).await? else {
        return Ok(None);
    };
    let frame_type = FrameType::from_u8(header[0])?;
    let sequence = BigEndian::read_u32(&header[1..5]);
    let len = BigEndian::read_u16(&header[5..7]) as usize;
    let payload = if len == 0 {
        Vec::new()
    } else {
        channel
            .read_exact_or_eof(len)
            .await?
            .ok_or_else(|| Error::ProtocolError("framed payload truncated".into()))?
    };
    Ok(Some(Frame {
        frame_type,
        sequence,
        payload,
    }))
}

async fn read_frame_deadline(channel: &mut dyn ByteChannel, deadline: Instant) -> Result<Option<Frame>> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(remaining, read_frame(channel)).await {
        Ok(result) => result,
        Err(_) => Ok(None),
    }
}

fn encode_hello(local_prefix: &str, message_count: u16, max_batch: u8) -> Vec<u8> {
    let mut buf = vec![0u8; HELLO_PAYLOAD_LEN];
    buf[0] = PROTOCOL_VERSION;
    let prefix_bytes = local_prefix.as_bytes();
    let n = prefix_bytes.len().min(PREFIX_LEN);
    buf[1..1 + n].copy_from_slice(&prefix_bytes[..n]);
    BigEndian::write_u16(&mut buf[1 + PREFIX_LEN..3 + PREFIX_LEN], message_count);
    buf[3 + PREFIX_LEN] = max_batch;
    buf
}

struct Hello {
    version: u8,
    peer_prefix: String,
    message_count: u16,
    max_batch: u8,
}

fn decode_hello(payload: &[u8]) -> Result<Hello> {
    if payload.len() != HELLO_PAYLOAD_LEN {
        return Err(Error::ProtocolError("malformed HELLO payload".into()));
    }
    let version = payload[0];
    let peer_prefix = String::from_utf8_lossy(&payload[1..1 + PREFIX_LEN]).into_owned();
    let message_count = BigEndian::read_u16(&payload[1 + PREFIX_LEN..3 + PREFIX_LEN]);
    let max_batch = payload[3 + PREFIX_LEN];
    Ok(Hello {
        version,
        peer_prefix,
        message_count,
        max_batch,
    })
}

fn encode_message(index: u16, total: u16, hash: &[u8; 32], more_coming: bool, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_LEN + data.len());
    let mut header = [0u8; MESSAGE_HEADER_LEN];
    BigEndian::write_u16(&mut header[0..2], index);
    BigEndian::write_u16(&mut header[2..4], total);
    header[4..36].copy_from_slice(hash);
    header[36] = more_coming as u8;
    buf.extend_from_slice(&header);
    buf.extend_from_slice(data);
    buf
}

struct MessageFrame {
    hash: [u8; 32],
    data: Vec<u8>,
}

fn decode_message(payload: &[u8]) -> Result<MessageFrame> {
    if payload.len() < MESSAGE_HEADER_LEN {
        return Err(Error::ProtocolError("malformed MESSAGE payload".into()));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&payload[4..36]);
    Ok(MessageFrame {
        hash,
        data: payload[MESSAGE_HEADER_LEN..].to_vec(),
    })
}

fn encode_ack(acked_sequence: u32, received_count: u16) -> Vec<u8> {
    let mut buf = [0u8; MESSAGE_ACK_PAYLOAD_LEN];
    BigEndian::write_u32(&mut buf[0..4], acked_sequence);
    BigEndian::write_u16(&mut buf[4..6], received_count);
    buf.to_vec()
}

fn decode_ack(payload: &[u8]) -> Result<(u32, u16)> {
    if payload.len() != MESSAGE_ACK_PAYLOAD_LEN {
        return Err(Error::ProtocolError("malformed MESSAGE_ACK payload".into()));
    }
    Ok((
        BigEndian::read_u32(&payload[0..4]),
        BigEndian::read_u16(&payload[4..6]),
    ))
}

fn message_hash(msg: &Message) -> Result<[u8; 32]> {
    let canonical = serde_json::to_vec(msg)?;
    Ok(crate::crypto::sha256(&canonical))
}

struct ExchangeState {
    received_hashes: HashSet<[u8; 32]>,
    messages_received: u32,
    peer_done: bool,
}

/// Reads and dispatches frames until either `expected_ack` is received or
/// `deadline` passes. Incoming `MESSAGE`/`DONE` frames are handled as
/// side effects regardless of which sequence we're waiting on, since the
/// peer's own send loop runs independently of ours (spec §4.7
/// "EXCHANGING" — both directions progress concurrently).
async fn pump_until_ack(
    channel: &mut dyn ByteChannel,
    expected_ack: u32,
    deadline: Instant,
    state: &mut ExchangeState,
    message_store: &MessageStore,
) -> Result<bool> {
    loop {
        let Some(frame) = read_frame_deadline(channel, deadline).await? else {
            return Ok(false);
        };
        match frame.frame_type {
            FrameType::Message => {
                handle_incoming_message(channel, &frame, state, message_store).await?;
            }
            FrameType::MessageAck => {
                let (acked, _count) = decode_ack(&frame.payload)?;
                if acked == expected_ack {
                    return Ok(true);
                }
            }
            FrameType::Done => state.peer_done = true,
            FrameType::Error => {
                return Err(Error::ProtocolError("peer reported a protocol error".into()))
            }
            other => {
                return Err(Error::ProtocolError(format!(
                    "unexpected frame {other:?} while exchanging"
                )))
            }
        }
    }
}

async fn handle_incoming_message(
    channel: &mut dyn ByteChannel,
    frame: &Frame,
    state: &mut ExchangeState,
    message_store: &MessageStore,
) -> Result<()> {
    let decoded = decode_message(&frame.payload)?;
    if state.received_hashes.insert(decoded.hash) {
        let msg: Message = serde_json::from_slice(&decoded.data)?;
        message_store.insert(msg).await?;
        state.messages_received += 1;
    }
    write_frame(
        channel,
        FrameType::MessageAck,
        frame.sequence,
        &encode_ack(frame.sequence, state.messages_received as u16),
    )
    .await
}

/// Drains incoming frames until the peer sends `DONE`, for the side that
/// finished sending its own messages first (spec §4.7 "the other side
/// completes after draining its outgoing queue").
async fn drain_until_peer_done(
    channel: &mut dyn ByteChannel,
    deadline: Instant,
    state: &mut ExchangeState,
    message_store: &MessageStore,
) -> Result<()> {
    while !state.peer_done {
        let Some(frame) = read_frame_deadline(channel, deadline).await? else {
            return Err(Error::Timeout("framed exchange drain".into()));
        };
        match frame.frame_type {
            FrameType::Message => {
                handle_incoming_message(channel, &frame, state, message_store).await?;
            }
            FrameType::MessageAck => {} // our own messages are all acked by now
            FrameType::Done => state.peer_done = true,
            FrameType::Error => {
                return Err(Error::ProtocolError("peer reported a protocol error".into()))
            }
            other => {
                return Err(Error::ProtocolError(format!(
                    "unexpected frame {other:?} while draining"
                )))
            }
        }
    }
    Ok(())
}

/// Drives one full framed exchange session (spec §4.7 state machine).
pub async fn run_framed_exchange(
    channel: &mut dyn ByteChannel,
    initiator: bool,
    local_public_id_prefix: &str,
    outgoing: Vec<Message>,
    message_store: &MessageStore,
) -> Result<ExchangeOutcome> {
    run_framed_exchange_with_batch_cap(
        channel,
        initiator,
        local_public_id_prefix,
        outgoing,
        message_store,
        MAX_BATCH_SIZE,
    )
    .await
}

/// As [`run_framed_exchange`], but advertises `local_max_batch` instead of
/// [`MAX_BATCH_SIZE`] in the HELLO/HELLO_ACK handshake — the knob the
/// negotiated cap (spec §4.7) is tested through.
pub async fn run_framed_exchange_with_batch_cap(
    channel: &mut dyn ByteChannel,
    initiator: bool,
    local_public_id_prefix: &str,
    outgoing: Vec<Message>,
    message_store: &MessageStore,
    local_max_batch: u8,
) -> Result<ExchangeOutcome> {
    tokio::time::timeout(
        EXCHANGE_TIMEOUT,
        run_framed_exchange_inner(
            channel,
            initiator,
            local_public_id_prefix,
            outgoing,
            message_store,
            local_max_batch,
        ),
    )
    .await
    .map_err(|_| Error::Timeout("framed exchange session".into()))?
}

async fn run_framed_exchange_inner(
    channel: &mut dyn ByteChannel,
    initiator: bool,
    local_public_id_prefix: &str,
    outgoing: Vec<Message>,
    message_store: &MessageStore,
    local_max_batch: u8,
) -> Result<ExchangeOutcome> {
    let own_count = u16::try_from(outgoing.len().min(u16::MAX as usize)).unwrap_or(u16::MAX);
    let handshake_deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let peer_max_batch = if initiator {
        write_frame(
            channel,
            FrameType::Hello,
            0,
            &encode_hello(local_public_id_prefix, own_count, local_max_batch),
        )
        .await?;
        let frame = read_frame_deadline(channel, handshake_deadline)
            .await?
            .ok_or_else(|| Error::Timeout("waiting for HELLO_ACK".into()))?;
        if frame.frame_type != FrameType::HelloAck {
            return Err(Error::ProtocolError("expected HELLO_ACK".into()));
        }
        let hello = decode_hello(&frame.payload)?;
        if hello.version != PROTOCOL_VERSION {
            write_frame(channel, FrameType::Error, 0, &[1]).await.ok();
            return Err(Error::ProtocolError(format!(
                "protocol version mismatch: peer={} local={}",
                hello.version, PROTOCOL_VERSION
            )));
        }
        hello.max_batch
    } else {
        let frame = read_frame_deadline(channel, handshake_deadline)
            .await?
            .ok_or_else(|| Error::Timeout("waiting for HELLO".into()))?;
        if frame.frame_type != FrameType::Hello {
            return Err(Error::ProtocolError("expected HELLO".into()));
        }
        let hello = decode_hello(&frame.payload)?;
        if hello.version != PROTOCOL_VERSION {
            write_frame(channel, FrameType::Error, 0, &[1]).await.ok();
            return Err(Error::ProtocolError(format!(
                "protocol version mismatch: peer={} local={}",
                hello.version, PROTOCOL_VERSION
            )));
        }
        write_frame(
            channel,
            FrameType::HelloAck,
            0,
            &encode_hello(local_public_id_prefix, own_count, local_max_batch),
        )
        .await?;
        hello.max_batch
    };
    let max_batch = local_max_batch.min(peer_max_batch) as usize;
    let outgoing = &outgoing[..outgoing.len().min(max_batch)];

    let mut state = ExchangeState {
        received_hashes: HashSet::new(),
        messages_received: 0,
        peer_done: false,
    };

    let mut sequence = 1u32;
    let mut messages_sent = 0u32;
    let exchange_deadline = Instant::now() + EXCHANGE_TIMEOUT;

    for (index, msg) in outgoing.iter().enumerate() {
        let hash = message_hash(msg)?;
        let data = serde_json::to_vec(msg)?;
        let more_coming = index + 1 < outgoing.len();
        let payload = encode_message(index as u16, outgoing.len() as u16, &hash, more_coming, &data);

        let mut retries = 0u32;
        loop {
            write_frame(channel, FrameType::Message, sequence, &payload).await?;
            let ack_deadline = Instant::now() + MESSAGE_TIMEOUT;
            let acked = pump_until_ack(
                channel,
                sequence,
                ack_deadline.min(exchange_deadline),
                &mut state,
                message_store,
            )
            .await?;
            if acked {
                messages_sent += 1;
                sequence += 1;
                break;
            }
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(Error::Timeout(format!(
                    "no ACK for message sequence {sequence} after {MAX_RETRIES} retries"
                )));
            }
            if Instant::now() >= exchange_deadline {
                return Err(Error::Timeout("framed exchange session".into()));
            }
        }
    }

    write_frame(channel, FrameType::Done, sequence, &[]).await?;
    drain_until_peer_done(channel, exchange_deadline, &mut state, message_store).await?;

    Ok(ExchangeOutcome {
        common_friends: 0,
        messages_sent,
        messages_received: state.messages_received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::duplex_pair;

    fn msg(text: &str) -> Message {
        Message::new(text, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn happy_path_exchanges_two_messages_each_direction() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();

        let outgoing_a = vec![msg("a1"), msg("a2")];
        let outgoing_b = vec![msg("b1"), msg("b2")];

        let (res_a, res_b) = tokio::join!(
            run_framed_exchange(&mut a, true, "aaaaaaaa", outgoing_a, &store_a),
            run_framed_exchange(&mut b, false, "bbbbbbbb", outgoing_b, &store_b),
        );
        let res_a = res_a.unwrap();
        let res_b = res_b.unwrap();

        assert_eq!(res_a.messages_sent, 2);
        assert_eq!(res_b.messages_sent, 2);
        assert_eq!(res_a.messages_received, 2);
        assert_eq!(res_b.messages_received, 2);
    }

    #[tokio::test]
    async fn negotiated_batch_cap_truncates_outgoing_messages() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();

        // More candidates than MAX_BATCH_SIZE on both sides; b advertises a
        // lower cap than MAX_BATCH_SIZE, so both directions must negotiate
        // down to it regardless of how many candidates either side has.
        let outgoing_a: Vec<Message> = (0..MAX_BATCH_SIZE as usize + 5)
            .map(|i| msg(&format!("a{i}")))
            .collect();
        let outgoing_b: Vec<Message> = (0..MAX_BATCH_SIZE as usize + 5)
            .map(|i| msg(&format!("b{i}")))
            .collect();
        let negotiated_cap = 3u8;

        let (res_a, res_b) = tokio::join!(
            run_framed_exchange_with_batch_cap(
                &mut a,
                true,
                "aaaaaaaa",
                outgoing_a,
                &store_a,
                MAX_BATCH_SIZE,
            ),
            run_framed_exchange_with_batch_cap(
                &mut b,
                false,
                "bbbbbbbb",
                outgoing_b,
                &store_b,
                negotiated_cap,
            ),
        );
        let res_a = res_a.unwrap();
        let res_b = res_b.unwrap();

        assert_eq!(res_a.messages_sent, negotiated_cap as u32);
        assert_eq!(res_b.messages_sent, negotiated_cap as u32);
        assert_eq!(res_a.messages_received, negotiated_cap as u32);
        assert_eq!(res_b.messages_received, negotiated_cap as u32);
    }

    #[tokio::test]
    async fn duplicate_message_hash_is_delivered_once() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();

        let shared = msg("duplicate-between-peers");
        let outgoing_a = vec![shared];
        let outgoing_b = vec![];

        let (res_a, res_b) = tokio::join!(
            run_framed_exchange(&mut a, true, "aaaaaaaa", outgoing_a, &store_a),
            run_framed_exchange(&mut b, false, "bbbbbbbb", outgoing_b, &store_b),
        );
        let res_a = res_a.unwrap();
        let res_b = res_b.unwrap();
        assert_eq!(res_b.messages_received, 1);
        assert_eq!(res_a.messages_sent, 1);
    }

    #[tokio::test]
    async fn empty_exchange_still_completes_with_done() {
        let (mut a, mut b) = duplex_pair();
        let store_a = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();
        let store_b = MessageStore::open(crate::database::Db::open_in_memory().unwrap(), 0.0)
            .await
            .unwrap();

        let (res_a, res_b) = tokio::join!(
            run_framed_exchange(&mut a, true, "aaaaaaaa", vec![], &store_a),
            run_framed_exchange(&mut b, false, "bbbbbbbb", vec![], &store_b),
        );
        assert_eq!(res_a.unwrap().messages_sent, 0);
        assert_eq!(res_b.unwrap().messages_sent, 0);
    }
}
