use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{score_millis, Disposition, Rankings};

/// Lower and upper quality bounds on the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min: f64,
    pub max: f64,
}

impl Thresholds {
    pub const DEFAULT_MIN: f64 = 0.5;
    pub const DEFAULT_MAX: f64 = 0.8;

    pub fn new(min: f64, max: f64) -> Result<Self, ConfigError> {
        for (name, value) in [("min_threshold", min), ("max_threshold", max)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if min > max {
            return Err(ConfigError::InvalidThreshold(format!(
                "min_threshold ({}) is greater than max_threshold ({})",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// A single legacy threshold collapses the review band.
    pub fn single(threshold: f64) -> Result<Self, ConfigError> {
        Self::new(threshold, threshold)
    }

    /// Resolve from the optional settings keys.
    pub fn resolve(
        min: Option<f64>,
        max: Option<f64>,
        legacy: Option<f64>,
    ) -> Result<Self, ConfigError> {
        match (min, max, legacy) {
            (Some(min), Some(max), _) => Self::new(min, max),
            (Some(_), None, _) | (None, Some(_), _) => Err(ConfigError::InvalidThreshold(
                "min_threshold and max_threshold must be set together".to_string(),
            )),
            (None, None, Some(threshold)) => Self::single(threshold),
            (None, None, None) => Self::new(Self::DEFAULT_MIN, Self::DEFAULT_MAX),
        }
    }

    pub fn has_review_band(&self) -> bool {
        self.min < self.max
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityClassifier {
    thresholds: Thresholds,
}

impl QualityClassifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn classify(&self, rankings: &Rankings) -> Disposition {
        self.classify_score(rankings.combined())
    }

    /// Bounds are compared in thousandths, so a mean such as
    /// `(0.7 + 0.7 + 0.7) / 3` lands on 0.7 rather than just below it.
    pub fn classify_score(&self, combined: f64) -> Disposition {
        let score = score_millis(combined);
        if score < score_millis(self.thresholds.min) {
            Disposition::Rejected
        } else if score >= score_millis(self.thresholds.max) {
            Disposition::Accepted
        } else {
            Disposition::PendingReview
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(min: f64, max: f64) -> QualityClassifier {
        QualityClassifier::new(Thresholds::new(min, max).unwrap())
    }

    #[test]
    fn test_three_bands() {
        let c = classifier(0.3, 0.7);
        assert_eq!(c.classify(&Rankings::new(0.9, 0.9, 0.9)), Disposition::Accepted);
        assert_eq!(c.classify(&Rankings::new(0.5, 0.5, 0.5)), Disposition::PendingReview);
        assert_eq!(c.classify(&Rankings::new(0.1, 0.1, 0.1)), Disposition::Rejected);
    }

    #[test]
    fn test_boundaries() {
        let c = classifier(0.3, 0.7);
        assert_eq!(c.classify_score(0.7), Disposition::Accepted);
        assert_eq!(c.classify_score(0.3), Disposition::PendingReview);
        assert_eq!(c.classify_score(0.299), Disposition::Rejected);
    }

    #[test]
    fn test_mean_exactly_on_a_bound() {
        let c = classifier(0.3, 0.7);
        assert!(Rankings::new(0.7, 0.7, 0.7).combined() < 0.7);
        assert_eq!(c.classify(&Rankings::new(0.7, 0.7, 0.7)), Disposition::Accepted);
        assert_eq!(c.classify(&Rankings::new(0.3, 0.3, 0.3)), Disposition::PendingReview);
        assert_eq!(c.classify(&Rankings::new(0.1, 0.2, 0.6)), Disposition::PendingReview);

        let single = QualityClassifier::new(Thresholds::single(0.7).unwrap());
        assert_eq!(single.classify(&Rankings::new(0.7, 0.7, 0.7)), Disposition::Accepted);
    }

    #[test]
    fn test_holds_for_threshold_grid() {
        let steps: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        for &min in &steps {
            for &max in steps.iter().filter(|m| **m >= min) {
                let c = classifier(min, max);
                for &score in &steps {
                    let expected = if score >= max {
                        Disposition::Accepted
                    } else if score < min {
                        Disposition::Rejected
                    } else {
                        Disposition::PendingReview
                    };
                    assert_eq!(c.classify_score(score), expected, "min={min} max={max} score={score}");
                }
            }
        }
    }

    #[test]
    fn test_single_threshold_has_no_review_band() {
        let c = QualityClassifier::new(Thresholds::single(0.6).unwrap());
        assert!(!c.thresholds().has_review_band());
        for score in [0.0, 0.3, 0.59, 0.6, 0.61, 1.0] {
            assert_ne!(c.classify_score(score), Disposition::PendingReview);
        }
        assert_eq!(c.classify_score(0.6), Disposition::Accepted);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            Thresholds::resolve(Some(0.2), Some(0.65), Some(0.9)).unwrap(),
            Thresholds { min: 0.2, max: 0.65 }
        );
        assert_eq!(
            Thresholds::resolve(None, None, Some(0.4)).unwrap(),
            Thresholds { min: 0.4, max: 0.4 }
        );
        assert_eq!(Thresholds::resolve(None, None, None).unwrap(), Thresholds::default());
        assert!(Thresholds::resolve(Some(0.2), None, None).is_err());
        assert!(Thresholds::resolve(Some(0.8), Some(0.2), None).is_err());
        assert!(Thresholds::resolve(None, None, Some(1.5)).is_err());
        assert!(Thresholds::new(f64::NAN, 0.5).is_err());
    }
}
