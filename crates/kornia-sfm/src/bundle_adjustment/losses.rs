//! Robust loss functions for iteratively reweighted least squares.

use serde::{Deserialize, Serialize};

/// Trait for robust loss functions that scale residuals by weight.
pub trait RobustLoss: Send + Sync {
    /// Compute loss weight for a squared residual norm.
    fn weight(&self, squared_norm: f64) -> f64;

    /// Robustified cost `rho(s)` of a squared residual norm.
    fn cost(&self, squared_norm: f64) -> f64;
}

/// Identity loss: weight always 1.0 (L2 baseline).
#[derive(Debug, Clone, Copy)]
pub struct IdentityLoss;

impl RobustLoss for IdentityLoss {
    fn weight(&self, _squared_norm: f64) -> f64 {
        1.0
    }

    fn cost(&self, squared_norm: f64) -> f64 {
        squared_norm
    }
}

/// Huber loss: smooth transition from quadratic to linear weighting.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    /// Residual norm where the loss becomes linear.
    pub delta: f64,
}

impl HuberLoss {
    /// Create new Huber loss. Panics if delta <= 0.
    pub fn new(delta: f64) -> Self {
        assert!(delta > 0.0, "Huber delta must be positive, got {}", delta);
        HuberLoss { delta }
    }
}

impl RobustLoss for HuberLoss {
    fn weight(&self, squared_norm: f64) -> f64 {
        let delta_sq = self.delta * self.delta;
        if squared_norm <= delta_sq {
            1.0
        } else {
            self.delta / squared_norm.sqrt()
        }
    }

    fn cost(&self, squared_norm: f64) -> f64 {
        let delta_sq = self.delta * self.delta;
        if squared_norm <= delta_sq {
            squared_norm
        } else {
            2.0 * self.delta * squared_norm.sqrt() - delta_sq
        }
    }
}

/// Cauchy loss: aggressive outlier rejection via 1/(1 + s/σ²).
#[derive(Debug, Clone, Copy)]
pub struct CauchyLoss {
    /// Scale of the inlier residuals.
    pub scale: f64,
}

impl CauchyLoss {
    /// Create new Cauchy loss. Panics if scale <= 0.
    pub fn new(scale: f64) -> Self {
        assert!(scale > 0.0, "Cauchy scale must be positive, got {}", scale);
        CauchyLoss { scale }
    }
}

impl RobustLoss for CauchyLoss {
    fn weight(&self, squared_norm: f64) -> f64 {
        let scale_sq = self.scale * self.scale;
        1.0 / (1.0 + squared_norm / scale_sq)
    }

    fn cost(&self, squared_norm: f64) -> f64 {
        let scale_sq = self.scale * self.scale;
        scale_sq * (1.0 + squared_norm / scale_sq).ln()
    }
}

/// Serializable selection of a robust loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossFunction {
    /// Plain least squares.
    Identity,
    /// Huber loss with the given threshold.
    Huber {
        /// Residual norm where the loss becomes linear.
        delta: f64,
    },
    /// Cauchy loss with the given scale.
    Cauchy {
        /// Scale of the inlier residuals.
        scale: f64,
    },
}

impl LossFunction {
    /// Whether the parameters are usable.
    pub fn is_valid(&self) -> bool {
        match *self {
            LossFunction::Identity => true,
            LossFunction::Huber { delta } => delta > 0.0 && delta.is_finite(),
            LossFunction::Cauchy { scale } => scale > 0.0 && scale.is_finite(),
        }
    }

    /// Build the boxed loss. Panics on invalid parameters, see [`LossFunction::is_valid`].
    pub fn build(&self) -> Box<dyn RobustLoss> {
        match *self {
            LossFunction::Identity => Box::new(IdentityLoss),
            LossFunction::Huber { delta } => Box::new(HuberLoss::new(delta)),
            LossFunction::Cauchy { scale } => Box::new(CauchyLoss::new(scale)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_loss_always_one() {
        let loss = IdentityLoss;
        assert_eq!(loss.weight(0.0), 1.0);
        assert_eq!(loss.weight(100.0), 1.0);
        assert_eq!(loss.cost(4.0), 4.0);
    }

    #[test]
    fn test_huber_loss_weights() {
        let huber = HuberLoss::new(1.0);
        assert_eq!(huber.weight(0.0), 1.0);
        assert_eq!(huber.weight(1.0), 1.0);
        assert!((huber.weight(4.0) - 0.5).abs() < 1e-12);
        assert!(huber.weight(1e12).is_finite());
        // continuous at the threshold
        assert!((huber.cost(1.0) - 1.0).abs() < 1e-12);
        assert!((huber.cost(4.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "Huber delta must be positive")]
    fn test_huber_loss_zero_delta_panics() {
        HuberLoss::new(0.0);
    }

    #[test]
    fn test_cauchy_loss_weights() {
        let cauchy = CauchyLoss::new(1.0);
        assert_eq!(cauchy.weight(0.0), 1.0);
        assert!((cauchy.weight(10.0) - (1.0 / 11.0)).abs() < 1e-12);
        assert!(cauchy.cost(10.0) < 10.0);
    }

    #[test]
    #[should_panic(expected = "Cauchy scale must be positive")]
    fn test_cauchy_loss_negative_scale_panics() {
        CauchyLoss::new(-1.0);
    }

    #[test]
    fn test_huber_vs_cauchy_outlier_behavior() {
        let huber = LossFunction::Huber { delta: 1.0 }.build();
        let cauchy = LossFunction::Cauchy { scale: 1.0 }.build();
        let w_huber = huber.weight(100.0);
        assert!((w_huber - 0.1).abs() < 1e-12);
        assert!(cauchy.weight(100.0) < w_huber);
    }

    #[test]
    fn test_loss_function_serde() -> Result<(), serde_json::Error> {
        let loss: LossFunction = serde_json::from_str(r#"{"type":"huber","delta":3.0}"#)?;
        assert_eq!(loss, LossFunction::Huber { delta: 3.0 });
        assert!(loss.is_valid());
        assert!(!LossFunction::Cauchy { scale: 0.0 }.is_valid());
        Ok(())
    }
}
