//! Small helpers shared across the crate.

// ---------------------------------------------------------------------------
// Deterministic jitter based on std — avoids pulling in the `rand` crate.
// Uses a simple xorshift seeded from the current time.
// ---------------------------------------------------------------------------

fn xorshift64() -> u64 {
    // Seed from high-resolution clock — good enough for jitter, not crypto.
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Uniform value in `[0, max_ms)` milliseconds.
pub fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    xorshift64() % max_ms
}

/// Multiplicative jitter factor uniform in `[1 - spread, 1 + spread)`.
///
/// `spread` is clamped to `[0, 1]`. Used by the retry policy to spread
/// backoff delays (±20% by default).
pub fn jitter_factor(spread: f64) -> f64 {
    let spread = spread.clamp(0.0, 1.0);
    if spread == 0.0 {
        return 1.0;
    }
    let unit = (xorshift64() % 1_000_000) as f64 / 1_000_000.0;
    1.0 - spread + unit * 2.0 * spread
}
