use anyhow::bail;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};

/// Fixed-size random session identifier, used to route packets to the
///  correct session context.
///
/// The all-zero value is the 'undefined' sentinel. Equality (`==`) compares
///  all bytes; [`Self::eq_weak`] compares only the 64-bit shortform, which
///  lets a server recognize a returning peer from a truncated wire
///  representation. A weak match must never be taken for identity on its
///  own - see [`find_weak`] for the collision check.
///
/// Created once per session at handshake initiation, immutable thereafter.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SessionId<const SIZE: usize>([u8; SIZE]);

pub type SessionId64 = SessionId<8>;
pub type SessionId128 = SessionId<16>;

impl<const SIZE: usize> SessionId<SIZE> {
    pub const UNDEFINED: SessionId<SIZE> = SessionId([0u8; SIZE]);

    /// Generates a fresh random id from the operating system's CSPRNG.
    pub fn random() -> SessionId<SIZE> {
        Self::random_with(&mut OsRng)
    }

    /// Generates a fresh random id from a caller-supplied RNG. The
    ///  `CryptoRng` bound enforces a crypto-grade source at compile time.
    pub fn random_with<R: RngCore + CryptoRng>(rng: &mut R) -> SessionId<SIZE> {
        assert!(SIZE >= 8, "session ids are at least 8 bytes");
        let mut bytes = [0u8; SIZE];
        rng.fill_bytes(&mut bytes);
        SessionId(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<SessionId<SIZE>> {
        if bytes.len() != SIZE {
            bail!("session id must be {} bytes, got {}", SIZE, bytes.len());
        }
        let mut raw = [0u8; SIZE];
        raw.copy_from_slice(bytes);
        Ok(SessionId(raw))
    }

    /// Decodes the URL-safe base64 text form produced by `to_string`.
    pub fn from_base64(encoded: &str) -> anyhow::Result<SessionId<SIZE>> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
        Self::from_bytes(&bytes)
    }

    /// Truncates or zero-extends into a differently-sized id. The leading
    ///  8 bytes (and with them the shortform) are preserved.
    pub fn resized<const M: usize>(&self) -> SessionId<M> {
        let mut raw = [0u8; M];
        let n = SIZE.min(M);
        raw[..n].copy_from_slice(&self.0[..n]);
        SessionId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; SIZE] {
        &self.0
    }

    /// False for the all-zero sentinel.
    pub fn defined(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }

    /// The leading 64 bits, used for weak comparison and hashing.
    pub fn shortform(&self) -> u64 {
        assert!(SIZE >= 8, "session ids are at least 8 bytes");
        u64::from_be_bytes(self.0[..8].try_into().expect("8-byte prefix"))
    }

    /// Weak equality: shortforms match. Implied by strong equality; the
    ///  converse does not hold.
    pub fn eq_weak<const M: usize>(&self, other: &SessionId<M>) -> bool {
        self.shortform() == other.shortform()
    }
}

impl<const SIZE: usize> Display for SessionId<SIZE> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

/// Locates a map entry whose shortform matches `key`. With `exclude_strong`
///  set, entries that are also strongly equal are skipped - this isolates
///  genuine shortform collisions between distinct sessions, which must be
///  treated as 'not the same session'.
pub fn find_weak<'a, const SIZE: usize, V>(
    map: &'a FxHashMap<SessionId<SIZE>, V>,
    key: &SessionId<SIZE>,
    exclude_strong: bool,
) -> Option<(&'a SessionId<SIZE>, &'a V)> {
    map.iter()
        .find(|(candidate, _)| candidate.eq_weak(key) && !(exclude_strong && **candidate == *key))
}
