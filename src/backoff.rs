//! Delay computation for (re)sent messages.

use rand::Rng;

/// The longest delay the queue accepts for a message, in seconds (15 minutes).
pub const MAX_DELAY_SECONDS: u32 = 900;

/// Exponential backoff for a message that has been attempted `attempts` times:
/// `2^attempts - 1` seconds, capped at [`MAX_DELAY_SECONDS`].
pub fn exponential(attempts: u32) -> u32 {
    // 2^10 - 1 already exceeds the cap
    if attempts >= 10 {
        return MAX_DELAY_SECONDS;
    }
    ((1u32 << attempts) - 1).min(MAX_DELAY_SECONDS)
}

/// Delay in seconds for a message, with optional jitter.
///
/// With a jitter ceiling, a uniformly random delay in `[0, min(900, ceiling))` is drawn
/// and the larger of it and the exponential backoff is used. Jitter only ever raises
/// the delay. A ceiling of zero disables jitter.
pub fn delay<R: Rng + ?Sized>(attempts: u32, jitter_ceiling: Option<u32>, rng: &mut R) -> u32 {
    let backoff = exponential(attempts);

    let ceiling = match jitter_ceiling {
        Some(ceiling) if ceiling > 0 => ceiling.min(MAX_DELAY_SECONDS),
        _ => return backoff,
    };

    backoff.max(rng.gen_range(0..ceiling))
}
