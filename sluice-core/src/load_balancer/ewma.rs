//! Exponentially Weighted Moving Average (EWMA) of endpoint latency.
//!
//! Each endpoint owns one cell. Cells are updated lock-free after every
//! completed request, so recording latency for one endpoint never blocks
//! selection across the others.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default weight given to history on each update.
pub const DEFAULT_DECAY: f64 = 0.5;

/// Bit pattern marking a cell that has never seen a sample.
const NO_SAMPLE: u64 = u64::MAX;

/// Moving average of one endpoint's response latency.
#[derive(Debug)]
pub struct Ewma {
    /// The current average in milliseconds, stored as the bits of an f64 to
    /// allow lock-free atomic updates. `NO_SAMPLE` until the first request.
    bits: AtomicU64,

    /// The decay rate. A higher alpha (e.g. 0.9) means older samples decay slower.
    /// A lower alpha (e.g. 0.1) means the average favors recent data heavily.
    decay_alpha: f64,
}

impl Ewma {
    /// Create a tracker with no history.
    ///
    /// `decay_alpha` is clamped into `[0, 1)`.
    pub fn new(decay_alpha: f64) -> Self {
        Self {
            bits: AtomicU64::new(NO_SAMPLE),
            decay_alpha: decay_alpha.clamp(0.0, 0.999),
        }
    }

    /// Read the current moving average, if any sample has been observed.
    pub fn get_ewma(&self) -> Option<f64> {
        match self.bits.load(Ordering::Relaxed) {
            NO_SAMPLE => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// Whether at least one sample has been recorded.
    pub fn has_history(&self) -> bool {
        self.get_ewma().is_some()
    }

    /// Update the moving average with a newly observed latency sample.
    pub fn observe_latency(&self, rtt_ms: f64) {
        if !rtt_ms.is_finite() || rtt_ms < 0.0 {
            return;
        }

        let mut current_bits = self.bits.load(Ordering::Acquire);

        loop {
            // The first sample seeds the average directly.
            let next_ewma = match current_bits {
                NO_SAMPLE => rtt_ms,
                bits => {
                    let current = f64::from_bits(bits);
                    (rtt_ms * (1.0 - self.decay_alpha)) + (current * self.decay_alpha)
                }
            };

            match self.bits.compare_exchange_weak(
                current_bits,
                next_ewma.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                // Another request completed under us. Retry on its value.
                Err(updated_bits) => current_bits = updated_bits,
            }
        }
    }

    /// The routing cost of this endpoint. Lower is better.
    ///
    /// An endpoint without history scores 0, the best possible value, so
    /// freshly added endpoints receive traffic straight away.
    pub fn calculate_score(&self) -> f64 {
        self.get_ewma().unwrap_or(0.0)
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_cell_scores_best() {
        let ewma = Ewma::default();
        assert!(!ewma.has_history());
        assert_eq!(ewma.calculate_score(), 0.0);
    }

    #[test]
    fn test_first_sample_seeds_then_decays() {
        let ewma = Ewma::new(0.5);
        ewma.observe_latency(100.0);
        assert_eq!(ewma.get_ewma(), Some(100.0));

        ewma.observe_latency(50.0);
        assert_eq!(ewma.get_ewma(), Some(75.0));

        // A spike is blended in, not jumped to.
        ewma.observe_latency(275.0);
        assert_eq!(ewma.get_ewma(), Some(175.0));
    }

    #[test]
    fn test_invalid_samples_are_ignored() {
        let ewma = Ewma::new(0.5);
        ewma.observe_latency(f64::NAN);
        ewma.observe_latency(-1.0);
        assert!(!ewma.has_history());
    }

    #[test]
    fn test_concurrent_updates_stay_in_range() {
        let ewma = Arc::new(Ewma::new(0.9));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ewma = Arc::clone(&ewma);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        ewma.observe_latency(10.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let value = ewma.get_ewma().unwrap();
        assert!((value - 10.0).abs() < 1e-9, "drifted to {value}");
    }
}
