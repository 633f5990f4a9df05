//! Time-ordered UUIDv7 identifiers with a reconstructible mint
//!
//! Action ids in the replication protocol are UUIDv7 values laid out per
//! draft-ietf-uuidrev-rfc4122bis §5.7:
//!
//! - bytes 0..5: unsigned big-endian millisecond timestamp (48 bits)
//! - byte 6: version nibble `0x7` plus the high 4 bits of a 12-bit sequence
//! - byte 7: the low 8 bits of the sequence
//! - byte 8: variant bits `10` in the top two positions
//! - remaining bits: pseudo-random fill
//!
//! Unlike a conventional v7 generator, the random fill here is *derived*:
//! SHA-256 over the generator seed with the timestamp written into its time
//! slots and the sequence appended. Given the same seed, timestamp, and
//! sequence, `mint` produces the same 16 bytes on any machine. The server
//! hands each client a signed seed and can later re-mint any id the client
//! claims to have produced, so byte-equality of the reconstruction is a cheap
//! proof that the id came from the issued seed.
//!
//! The hyphenated lowercase hex form of these ids sorts lexicographically in
//! the same order as the raw bytes, which is what makes the id high-water
//! mark comparison in the server a plain `Uuid` ordering test.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length in bytes of a generation-parameter seed block.
///
/// The first [`TS_LEN`] bytes are reserved for the millisecond timestamp; the
/// remaining 74 bytes are random material issued by the server.
pub const INIT_BYTES_LEN: usize = 80;

/// Number of leading seed bytes that carry the big-endian ms timestamp.
pub const TS_LEN: usize = 6;

/// Exclusive upper bound of the 12-bit per-millisecond sequence.
pub const SEQ_LIMIT: u16 = 4096;

/// Deterministic per-client (or per-context) UUIDv7 generator state.
///
/// A `GenState` is decoded from a signed parameter bundle on the client side
/// and reconstructed from the same bundle on the server side when an id needs
/// verification. The server additionally keeps one worker-owned `GenState`
/// per context for minting authoritative ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenState {
    /// Bundle issue time; ids minted under this state carry timestamps at or
    /// after this instant.
    pub not_before: u64,
    /// Timestamp of the most recently minted id.
    pub last_gen_ts: u64,
    /// Sequence used within `last_gen_ts`.
    pub last_gen_seq: u16,
    /// Seed material with the [`TS_LEN`] time slots zeroed.
    pub seed: [u8; INIT_BYTES_LEN],
}

impl GenState {
    /// Decodes generator state from the raw `initBytes` of a parameter
    /// bundle. Returns `None` unless the slice is exactly
    /// [`INIT_BYTES_LEN`] bytes.
    ///
    /// The leading timestamp bytes are moved into `not_before` and zeroed in
    /// the retained seed, so minting and verification always operate on the
    /// same byte image.
    pub fn decode(init_bytes: &[u8]) -> Option<Self> {
        if init_bytes.len() != INIT_BYTES_LEN {
            return None;
        }

        let mut seed = [0u8; INIT_BYTES_LEN];
        seed.copy_from_slice(init_bytes);

        let mut ts_bytes = [0u8; 8];
        ts_bytes[2..8].copy_from_slice(&seed[..TS_LEN]);
        let not_before = u64::from_be_bytes(ts_bytes);

        seed[..TS_LEN].fill(0);

        Some(Self {
            not_before,
            last_gen_ts: not_before,
            last_gen_seq: 0,
            seed,
        })
    }

    /// Creates fresh state from random seed material, stamped `now`.
    ///
    /// Used for the server-side authoritative minter; client-held state
    /// always comes from [`GenState::decode`].
    pub fn fresh(now_ms: u64) -> Self {
        use rand::RngCore;

        let mut seed = [0u8; INIT_BYTES_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        seed[..TS_LEN].fill(0);

        Self {
            not_before: now_ms,
            last_gen_ts: now_ms,
            last_gen_seq: 0,
            seed,
        }
    }
}

/// Mints a UUIDv7 under `state`.
///
/// With `ts` and `seq` both supplied the function is pure: identical inputs
/// yield identical bytes and `state` is left untouched. That mode exists for
/// verification, where the timestamp and sequence are extracted from the id
/// under test.
///
/// With `ts` omitted, the wall clock is used but never allowed to run
/// backwards past `state.last_gen_ts`. A repeat timestamp increments the
/// sequence; sequence exhaustion (≥ [`SEQ_LIMIT`]) advances the timestamp by
/// one millisecond and resets the sequence. The chosen pair is recorded in
/// `state` so successive mints are strictly increasing.
pub fn mint(state: &mut GenState, ts: Option<u64>, seq: Option<u16>) -> Uuid {
    if let (Some(ts), Some(seq)) = (ts, seq) {
        return build(&state.seed, ts, seq);
    }

    let mut ts = ts.unwrap_or_else(now_ms).max(state.last_gen_ts);
    let seq = match seq {
        Some(seq) => seq,
        None if ts == state.last_gen_ts => {
            let next = state.last_gen_seq + 1;
            if next >= SEQ_LIMIT {
                ts += 1;
                0
            } else {
                next
            }
        }
        None => 0,
    };

    state.last_gen_ts = ts;
    state.last_gen_seq = seq;
    build(&state.seed, ts, seq)
}

/// Checks that `candidate` was minted under `state`'s seed.
///
/// Parses the strict hyphenated form, rejects anything that is not a v7
/// value, then re-mints with the timestamp and sequence carried inside the
/// id itself and compares bytes.
pub fn verify(state: &GenState, candidate: &str) -> bool {
    let Some(id) = parse(candidate) else {
        return false;
    };
    if !is_v7(&id) {
        return false;
    }
    build(&state.seed, timestamp_of(&id), sequence_of(&id)) == id
}

/// Deterministic v7 construction from a seed, timestamp, and sequence.
fn build(seed: &[u8; INIT_BYTES_LEN], ts: u64, seq: u16) -> Uuid {
    let ts_bytes = ts.to_be_bytes();
    let seq = seq & (SEQ_LIMIT - 1);

    // Pseudo-random fill: digest the seed image with the timestamp written
    // into its time slots and the sequence appended.
    let mut image = [0u8; INIT_BYTES_LEN + 2];
    image[..INIT_BYTES_LEN].copy_from_slice(seed);
    image[..TS_LEN].copy_from_slice(&ts_bytes[2..8]);
    image[INIT_BYTES_LEN..].copy_from_slice(&seq.to_be_bytes());
    let digest = Sha256::digest(image);

    let mut bytes = [0u8; 16];
    bytes[..TS_LEN].copy_from_slice(&ts_bytes[2..8]);
    bytes[6] = 0x70 | ((seq >> 8) as u8 & 0x0F);
    bytes[7] = (seq & 0xFF) as u8;
    bytes[8..].copy_from_slice(&digest[..8]);
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Millisecond timestamp carried in the first six bytes of a v7 id.
pub fn timestamp_of(id: &Uuid) -> u64 {
    let b = id.as_bytes();
    let mut ts_bytes = [0u8; 8];
    ts_bytes[2..8].copy_from_slice(&b[..TS_LEN]);
    u64::from_be_bytes(ts_bytes)
}

/// 12-bit per-millisecond sequence carried across bytes 6 and 7.
pub fn sequence_of(id: &Uuid) -> u16 {
    let b = id.as_bytes();
    ((b[6] as u16 & 0x0F) << 8) | b[7] as u16
}

/// Tests the version and variant nibbles for the v7 layout.
pub fn is_v7(id: &Uuid) -> bool {
    let b = id.as_bytes();
    b[6] >> 4 == 0x7 && b[8] >> 6 == 0b10
}

/// Strict parser for the 36-character hyphenated form.
///
/// Dashes must sit exactly at positions 8, 13, 18, and 23; every other
/// position must be a hex digit. Anything else is rejected, including the
/// braced, URN, and undashed spellings that lenient parsers accept.
pub fn parse(text: &str) -> Option<Uuid> {
    let raw = text.as_bytes();
    if raw.len() != 36 {
        return None;
    }

    let mut bytes = [0u8; 16];
    let mut nibbles = 0usize;
    for (pos, &c) in raw.iter().enumerate() {
        if matches!(pos, 8 | 13 | 18 | 23) {
            if c != b'-' {
                return None;
            }
            continue;
        }
        let value = hex_value(c)?;
        bytes[nibbles / 2] = (bytes[nibbles / 2] << 4) | value;
        nibbles += 1;
    }

    Some(Uuid::from_bytes(bytes))
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
