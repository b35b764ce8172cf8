//! Private Set Intersection Cardinality (PSI-Ca) over Ristretto255.
//!
//! Commutative (Diffie-Hellman-style) blinding: each side maps its set
//! elements onto curve points, blinds them with a private scalar, and the
//! two sides exchange blinded values so that only the *cardinality* of the
//! intersection is revealed, never the elements themselves.
//!
//! Let `H` map an item to a curve point and `a`, `b` be the client's and
//! server's private scalars.
//!
//! 1. Client sends `{a·H(x) : x ∈ A}` ("blinded_items").
//! 2. Server re-blinds each with `b`, returning `{b·(a·H(x)) : x ∈ A}`
//!    ("double_blinded") — the client can remove its own blind (`a⁻¹`) to
//!    get `{b·H(x) : x ∈ A}`.
//! 3. Server also blinds its own set with `b` and hashes the result:
//!    `{SHA256(b·H(y)) : y ∈ B}` ("hashed_blinded").
//! 4. Client hashes its unblinded values from step 2 and intersects them
//!    against `hashed_blinded`; the match count is `|A ∩ B|`.
//!
//! Neither side ever learns an element of the other side's set — only
//! `b·H(x)` or its hash, which is infeasible to invert without `b`.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Maps an arbitrary byte string onto a Ristretto255 point via a
/// wide (64-byte) hash, as required by `RistrettoPoint::from_uniform_bytes`.
fn hash_to_point(item: &[u8]) -> RistrettoPoint {
    let mut hasher = Sha512::new();
    hasher.update(b"RANGZEN_PSI_HASH_TO_POINT");
    hasher.update(item);
    let wide: [u8; 64] = hasher.finalize().into();
    RistrettoPoint::from_uniform_bytes(&wide)
}

fn random_scalar() -> Scalar {
    let mut bytes = [0u8; 64];
    use rand::RngCore;
    OsRng.fill_bytes(&mut bytes);
    Scalar::from_bytes_mod_order_wide(&bytes)
}

fn point_hash(point: &RistrettoPoint) -> [u8; 32] {
    crate::crypto::sha256(point.compress().as_bytes())
}

/// The server's reply to a client's blinded set (spec §4.1 `ServerReply`).
#[derive(Debug, Clone)]
pub struct ServerReply {
    /// The client's own items, re-blinded by the server's scalar.
    pub double_blinded: Vec<Vec<u8>>,
    /// The server's own items, blinded by its scalar and then hashed.
    pub hashed_blinded: Vec<Vec<u8>>,
}

/// Client-side PSI-Ca context (spec §4.1 `ClientPSI`).
pub struct ClientPsi {
    blind: Scalar,
    blind_inv: Scalar,
    own_items: Vec<RistrettoPoint>,
}

impl ClientPsi {
    /// Initialize a PSI-Ca context over `own_friends`, each item encoded as
    /// its raw normalized bytes (e.g. a `FriendId`'s UTF-8 form).
    pub fn new<I, T>(own_friends: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let blind = random_scalar();
        let blind_inv = blind.invert();
        let own_items = own_friends
            .into_iter()
            .map(|item| hash_to_point(item.as_ref()))
            .collect();
        Self {
            blind,
            blind_inv,
            own_items,
        }
    }

    /// Encode this client's set, blinded by its private scalar, ready to
    /// send to the peer.
    pub fn encode_blinded_items(&self) -> Vec<Vec<u8>> {
        self.own_items
            .iter()
            .map(|p| (self.blind * p).compress().as_bytes().to_vec())
            .collect()
    }

    /// Given the peer's [`ServerReply`], compute `|own_friends ∩ peer_friends|`.
    pub fn get_cardinality(&self, reply: &ServerReply) -> Result<u32> {
        let peer_hashes: HashSet<[u8; 32]> = reply
            .hashed_blinded
            .iter()
            .map(|bytes| {
                let mut arr = [0u8; 32];
                if bytes.len() != 32 {
                    return Err(Error::CryptoFailure(
                        "malformed hashed_blinded entry".into(),
                    ));
                }
                arr.copy_from_slice(bytes);
                Ok(arr)
            })
            .collect::<Result<HashSet<_>>>()?;

        let mut count = 0u32;
        let mut seen = HashSet::new();
        for bytes in &reply.double_blinded {
            let compressed = CompressedRistretto::from_slice(bytes)
                .map_err(|_| Error::CryptoFailure("malformed double_blinded entry".into()))?;
            let point = compressed
                .decompress()
                .ok_or_else(|| Error::CryptoFailure("invalid curve point".into()))?;
            // Remove our own blind: b*(a*H(x)) * a^-1 = b*H(x)
            let unblinded = self.blind_inv * point;
            let hash = point_hash(&unblinded);
            if peer_hashes.contains(&hash) && seen.insert(hash) {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Server-side reply generation (spec §4.1 `psi_reply`). `own_friends` is
/// the responder's own set; `blinded_items` is the client's
/// [`ClientPsi::encode_blinded_items`] output.
pub fn psi_reply<I, T>(own_friends: I, blinded_items: &[Vec<u8>]) -> Result<ServerReply>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let blind = random_scalar();

    let double_blinded = blinded_items
        .iter()
        .map(|bytes| {
            let compressed = CompressedRistretto::from_slice(bytes)
                .map_err(|_| Error::CryptoFailure("malformed blinded item".into()))?;
            let point = compressed
                .decompress()
                .ok_or_else(|| Error::CryptoFailure("invalid curve point".into()))?;
            Ok((blind * point).compress().as_bytes().to_vec())
        })
        .collect::<Result<Vec<_>>>()?;

    let hashed_blinded = own_friends
        .into_iter()
        .map(|item| {
            let point = hash_to_point(item.as_ref());
            let blinded = blind * point;
            point_hash(&blinded).to_vec()
        })
        .collect();

    Ok(ServerReply {
        double_blinded,
        hashed_blinded,
    })
}
