use std::sync::Mutex;

/// Round-trip time estimate used before any measurement has arrived.
const INITIAL_RTT_MILLIS: u32 = 1_000;

/// Shared round-trip-time estimator for one peer.
///
/// Smoothing uses the formula from the original TCP specification:
/// `estimate = measurement + 0.9 * (estimate - measurement)`.
pub struct RttTracker {
    estimate: Mutex<Option<u32>>,
}

impl RttTracker {
    pub fn new() -> RttTracker {
        RttTracker {
            estimate: Mutex::new(None),
        }
    }

    /// Current estimate in milliseconds.
    pub fn current_rtt(&self) -> u32 {
        self.estimate
            .lock()
            .expect("rtt lock poisoned")
            .unwrap_or(INITIAL_RTT_MILLIS)
    }

    /// Folds a new measurement (milliseconds) into the estimate. The first
    /// measurement is taken as-is.
    pub fn update_rtt(&self, measurement: u32) {
        let mut estimate = self.estimate.lock().expect("rtt lock poisoned");
        *estimate = match *estimate {
            None => Some(measurement),
            Some(current) => {
                let smoothed =
                    measurement as f64 + 0.9 * (current as f64 - measurement as f64);
                Some(smoothed as u32)
            }
        };
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        RttTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_measurement_taken_verbatim() {
        let tracker = RttTracker::new();
        tracker.update_rtt(250);
        assert_eq!(tracker.current_rtt(), 250);
    }

    #[test]
    fn test_smoothing_weights_old_estimate() {
        let tracker = RttTracker::new();
        tracker.update_rtt(1000);
        tracker.update_rtt(500);
        // 500 + 0.9 * (1000 - 500) = 950
        assert_eq!(tracker.current_rtt(), 950);

        tracker.update_rtt(1950);
        // 1950 + 0.9 * (950 - 1950) = 1050
        assert_eq!(tracker.current_rtt(), 1050);
    }

    #[test]
    fn test_default_before_any_measurement() {
        let tracker = RttTracker::new();
        assert_eq!(tracker.current_rtt(), INITIAL_RTT_MILLIS);
    }
}
