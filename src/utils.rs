use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Number of hash slots in a cluster keyspace.
pub const SLOT_COUNT: u16 = 16384;

// Replica selection and random-slot fallback share one seeded generator; a
// SmallRng is not Sync so the mutex is required, not decorative.
static RNG: Lazy<Mutex<SmallRng>> = Lazy::new(|| Mutex::new(SmallRng::from_entropy()));

/// Compute CRC16 (XMODEM polynomial) over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Extract the hash tag from a key.
///
/// The tag is the substring between the first `{` and the first `}` that
/// follows it, provided the pair is non-adjacent. Keys without such a pair
/// hash as a whole, so `user:{42}:profile` and `{42}` land on the same slot.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// Hash slot of a key, honoring `{tag}` extraction.
pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// Uniformly random slot, used when a command carries no key.
pub fn random_slot() -> u16 {
    RNG.lock().gen_range(0..SLOT_COUNT)
}

/// Uniformly random index below `len`. `len` must be non-zero.
pub fn random_index(len: usize) -> usize {
    RNG.lock().gen_range(0..len)
}
