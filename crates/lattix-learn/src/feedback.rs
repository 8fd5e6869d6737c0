//! Violation-trend early stopping.
//!
//! The violation rate of an epoch is `violations / corrupted triples`. Once
//! more than `min_full_epochs` epochs have run, training stops as soon as the
//! rate dropped by less than `threshold` compared to the previous epoch. The
//! decision only depends on the counters fed in, so identical runs stop at
//! the same epoch.

use crate::config::LearnParams;

/// What to do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopDecision {
    Continue,
    Stop { improvement: f64 },
}

#[derive(Debug, Clone)]
pub struct EarlyStopPolicy {
    threshold: f64,
    min_full_epochs: u32,
    previous_rate: Option<f64>,
}

/// Violations per corrupted triple; 0 when nothing was scored.
pub fn violation_rate(violations: u64, corruptions: u64) -> f64 {
    if corruptions == 0 {
        0.0
    } else {
        violations as f64 / corruptions as f64
    }
}

impl EarlyStopPolicy {
    pub fn new(threshold: f64, min_full_epochs: u32) -> Self {
        Self {
            threshold,
            min_full_epochs,
            previous_rate: None,
        }
    }

    /// `None` unless `params.feedback` is set.
    pub fn from_params(params: &LearnParams) -> Option<Self> {
        params
            .feedback
            .then(|| Self::new(params.feedback_threshold, params.feedback_min_full_epochs))
    }

    /// Feed the counters of completed epoch `epoch` (1-based).
    pub fn observe(&mut self, epoch: u32, violations: u64, corruptions: u64) -> StopDecision {
        let rate = violation_rate(violations, corruptions);
        let decision = match self.previous_rate {
            Some(prev) if epoch > self.min_full_epochs => {
                let improvement = prev - rate;
                if improvement < self.threshold {
                    StopDecision::Stop { improvement }
                } else {
                    StopDecision::Continue
                }
            }
            _ => StopDecision::Continue,
        };
        self.previous_rate = Some(rate);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_full_epochs_always_run() {
        let mut p = EarlyStopPolicy::new(1.0, 2);
        assert_eq!(p.observe(1, 10, 10), StopDecision::Continue);
        assert_eq!(p.observe(2, 10, 10), StopDecision::Continue);
        assert!(matches!(p.observe(3, 10, 10), StopDecision::Stop { .. }));
    }

    #[test]
    fn test_keeps_going_while_improving() {
        let mut p = EarlyStopPolicy::new(0.05, 0);
        assert_eq!(p.observe(1, 80, 100), StopDecision::Continue);
        assert_eq!(p.observe(2, 60, 100), StopDecision::Continue);
        assert_eq!(p.observe(3, 40, 100), StopDecision::Continue);
        match p.observe(4, 38, 100) {
            StopDecision::Stop { improvement } => assert!((improvement - 0.02).abs() < 1e-12),
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn test_from_params_respects_flag() {
        let params = LearnParams::default();
        assert!(EarlyStopPolicy::from_params(&params).is_none());
        assert!(EarlyStopPolicy::from_params(&params.with_feedback(0.01, 2)).is_some());
    }

    #[test]
    fn test_rate_with_no_corruptions() {
        assert_eq!(violation_rate(0, 0), 0.0);
        assert_eq!(violation_rate(1, 4), 0.25);
    }
}
