//! Retransmission backoff (spec §4.1).
//!
//! Pure given its inputs; the only moving part is where the random draw
//! comes from, which is injected so tests can fix `r` and get an exact
//! expected delay instead of asserting a range.

use std::time::Duration;

/// Exponential base applied once the attempt index passes `THRESHOLD`.
pub const BASE: f64 = 1.6;
/// Upper bound on the multiplicative jitter term.
pub const JITTER: f64 = 0.25;
/// Safety margin over the peer's advertised interval.
pub const MARGIN: f64 = 1.1;
/// Attempts at or below this index use a flat (non-exponentiated) backoff.
pub const THRESHOLD: u32 = 1;
/// Total on-wire transmissions allowed for a single reliable message,
/// including the initial send.
pub const MAX_TRANSMISSIONS: u8 = 5;

/// Source of the random draw `r ∈ [0, 1)` used to jitter a backoff delay.
///
/// Production uses the process PRNG; tests pass a stub that returns a fixed
/// value so expected delays are exact rather than range assertions.
pub trait RandomSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// `rand`-backed source for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRandom;

impl RandomSource for ProcessRandom {
    fn next_unit(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Fixed draw, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_unit(&self) -> f64 {
        self.0
    }
}

/// Computes the retransmission delay for attempt `n` (0-indexed) given the
/// peer's advertised base interval `base`, using `random` for the jitter
/// draw.
pub fn calculate(base: Duration, attempt: u32, random: &dyn RandomSource) -> Duration {
    calculate_with_r(base, attempt, random.next_unit())
}

/// Delay with the jitter draw pinned to 0 — the minimum of the range.
pub fn calculate_min(base: Duration, attempt: u32) -> Duration {
    calculate_with_r(base, attempt, 0.0)
}

/// Delay with the jitter draw pinned to 1 — the maximum of the range.
pub fn calculate_max(base: Duration, attempt: u32) -> Duration {
    calculate_with_r(base, attempt, 1.0)
}

fn calculate_with_r(base: Duration, attempt: u32, r: f64) -> Duration {
    let exponent = attempt.saturating_sub(THRESHOLD);
    let backoff = base.as_secs_f64() * MARGIN * BASE.powi(exponent as i32) * (1.0 + r * JITTER);
    Duration::from_secs_f64(backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    const I: Duration = Duration::from_millis(300);

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn table_21_backoff_bounds() {
        let expected = [
            (330u64, 413u64),
            (330, 413),
            (528, 660),
            (845, 1056),
            (1352, 1690),
        ];
        for (attempt, (lo, hi)) in expected.into_iter().enumerate() {
            let min = ms(calculate_min(I, attempt as u32));
            let max = ms(calculate_max(I, attempt as u32));
            assert!(
                (lo.abs_diff(min)) <= 1,
                "attempt {attempt}: min {min} expected ~{lo}"
            );
            assert!(
                (hi.abs_diff(max)) <= 1,
                "attempt {attempt}: max {max} expected ~{hi}"
            );
        }
    }

    #[test]
    fn cumulative_maxima_match_table() {
        let expected_cumulative = [413u64, 825, 1485, 2541, 4231];
        let mut running = 0u64;
        for (attempt, expected) in expected_cumulative.into_iter().enumerate() {
            running += ms(calculate_max(I, attempt as u32));
            assert!(
                expected.abs_diff(running) <= 2,
                "cumulative after attempt {attempt}: {running} expected ~{expected}"
            );
        }
    }

    #[test]
    fn fixed_random_is_linear_in_r() {
        let half = calculate_with_r(I, 2, 0.5);
        let min = calculate_min(I, 2);
        let max = calculate_max(I, 2);
        assert!(half > min && half < max);
    }

    #[test]
    fn random_source_trait_object_works() {
        let r = FixedRandom(0.0);
        let d = calculate(I, 0, &r);
        assert_eq!(d, calculate_min(I, 0));
    }
}
