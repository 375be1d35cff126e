use sha2::{Digest, Sha256};

/// Uniform jitter in `[0, max_ms)` milliseconds.
///
/// Deterministic xorshift seeded from the clock; good enough for spreading
/// retries, not for anything cryptographic.
pub fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

/// 64-bit fingerprint of a natural id: the first 8 bytes of its SHA-256.
pub fn fingerprint(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
