//! Per-peer exchange sessions (spec §3 "ExchangeSession", §4.6
//! "LegacyExchange", §4.7 "FramedExchange").
//!
//! The two wire protocols share nothing but the crypto modules and the
//! message/friend stores (spec §9 "Dual exchange protocols" — "do not
//! attempt to unify frame layouts"). What they *do* share is the byte
//! pipe abstraction below: a session is driven by one task per spec §9's
//! "task + channel" design note, reading and writing an opaque ordered
//! byte stream handed to it by the scheduler after a [`crate::transport`]
//! driver accepts or opens a connection.

pub mod framed;
pub mod legacy;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The byte-stream interface an exchange session reads and writes. Each
/// protocol does its own framing on top of this (spec §4.6/§4.7); the
/// channel only guarantees ordered, reliable delivery of bytes, which is
/// what a BLE GATT characteristic stream, a WiFi-Aware socket, or a TCP
/// sub-channel (WiFi Direct / LAN, spec §4.5 step 3) all provide.
#[async_trait]
pub trait ByteChannel: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Reads exactly `len` bytes. Returns `Ok(None)` if the channel was
    /// closed before any byte of this read arrived (spec §4.6 "Any frame
    /// read returning nothing ends the phase"); returns an error if it
    /// closes partway through a frame, since that is a malformed session
    /// rather than a clean end.
    async fn read_exact_or_eof(&mut self, len: usize) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
impl<T> ByteChannel for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        AsyncWriteExt::write_all(self, buf).await.map_err(Error::Io)
    }

    async fn read_exact_or_eof(&mut self, len: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            let n = self.read(&mut buf[filled..]).await.map_err(Error::Io)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::ProtocolError(
                    "channel closed mid-frame".to_string(),
                ));
            }
            filled += n;
        }
        Ok(Some(buf))
    }
}

/// Outcome of a completed (or aborted) exchange session, reported to the
/// scheduler so it can update the peer's [`crate::scheduler::PeerBackoff`].
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub common_friends: u32,
    pub messages_sent: u32,
    pub messages_received: u32,
}
