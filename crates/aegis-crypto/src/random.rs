//! Secure random number generation.

use rand::Rng;
use std::time::Duration;

/// Fill a buffer with cryptographically secure random bytes
///
/// # Panics
///
/// Panics if the system CSPRNG fails (extremely unlikely).
pub fn fill(buf: &mut [u8]) {
    getrandom::getrandom(buf).expect("CSPRNG failure");
}

/// Generate `len` cryptographically secure random bytes
#[must_use]
pub fn bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    fill(&mut buf);
    buf
}

/// Generate a random `u64`
#[must_use]
pub fn u64() -> u64 {
    let mut buf = [0u8; 8];
    fill(&mut buf);
    u64::from_be_bytes(buf)
}

/// Generate a random `u64` that is never zero
#[must_use]
pub fn nonzero_u64() -> u64 {
    loop {
        let v = u64();
        if v != 0 {
            return v;
        }
    }
}

/// Uniform random `usize` in `[low, high]` (inclusive)
#[must_use]
pub fn range(low: usize, high: usize) -> usize {
    if low >= high {
        return low;
    }
    rand::thread_rng().gen_range(low..=high)
}

/// Uniform random duration in `[0, max]`
#[must_use]
pub fn delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max.as_millis() as u64))
}
