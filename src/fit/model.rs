//! The closed family of background models.
//!
//! Every model is linearized by the scalar transforms `fx`/`fy` and fitted with the same
//! least-squares solve; only LCPL needs a preliminary power-law pass to pick its exponents.

use crate::math_tools::floored_ln;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Lower bound applied before taking logarithms of counts or energies.
pub const LOG_FLOOR: f64 = 1e-3;

/// Background model selected for a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FitModel {
    /// No background; every evaluation is zero.
    NoFit,
    /// `c0`
    Constant,
    /// `c0 + c1·x`
    Linear,
    /// `exp(c0 + c1·x)`
    Exponential,
    /// `exp(c0)·x^c1`
    #[default]
    Power,
    /// Linear combination of two power laws, `c0·x^R1 + c1·x^R2`.
    Lcpl,
}

/// The fit state of one pixel.
///
/// `Unfit` marks a pixel without a usable background (solver fallback, disabled fit or the
/// all-zero coefficient sentinel of the log-domain models). It always evaluates to zero, which is
/// kept distinct from a genuine fit whose value happens to be zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelFit {
    Unfit,
    Fit { c0: f64, c1: f64 },
}

impl FitModel {
    pub const ALL: [FitModel; 6] = [
        FitModel::NoFit,
        FitModel::Constant,
        FitModel::Linear,
        FitModel::Exponential,
        FitModel::Power,
        FitModel::Lcpl,
    ];

    /// Number of free coefficients solved for.
    pub fn parameter_count(&self) -> usize {
        match self {
            FitModel::NoFit => 0,
            FitModel::Constant => 1,
            _ => 2,
        }
    }

    /// Models for which an all-zero coefficient pair means "no fit" rather than a value.
    pub fn has_zero_sentinel(&self) -> bool {
        matches!(
            self,
            FitModel::Exponential | FitModel::Power | FitModel::Lcpl
        )
    }

    /// Transform applied to the x-axis before solving.
    pub fn fx(&self, xi: f64) -> f64 {
        match self {
            FitModel::Power => floored_ln(xi),
            _ => xi,
        }
    }

    /// Transform applied to the observed counts before solving.
    pub fn fy(&self, yi: f64) -> f64 {
        match self {
            FitModel::Exponential | FitModel::Power => floored_ln(yi),
            _ => yi,
        }
    }

    /// One row of the basis matrix. Only the first `parameter_count` entries are used.
    ///
    /// `exponents` are the LCPL power-law exponents and are ignored by every other model.
    pub fn basis_row(&self, xi: f64, exponents: Option<[f64; 2]>) -> [f64; 2] {
        match self {
            FitModel::NoFit => [0.0, 0.0],
            FitModel::Constant => [1.0, 0.0],
            FitModel::Linear | FitModel::Exponential | FitModel::Power => [1.0, self.fx(xi)],
            FitModel::Lcpl => {
                let [r1, r2] = exponents.unwrap_or([0.0, 0.0]);
                let base = xi.max(LOG_FLOOR);
                [base.powf(r1), base.powf(r2)]
            }
        }
    }

    /// Evaluates the background of one pixel at `xi`.
    pub fn value_at(&self, fit: PixelFit, xi: f64, exponents: Option<[f64; 2]>) -> f64 {
        let (c0, c1) = match fit {
            PixelFit::Unfit => return 0.0,
            PixelFit::Fit { c0, c1 } => (c0, c1),
        };
        match self {
            FitModel::NoFit => 0.0,
            FitModel::Constant => c0,
            FitModel::Linear => c0 + c1 * xi,
            FitModel::Exponential => (c0 + c1 * xi).exp(),
            FitModel::Power => (c0 + c1 * floored_ln(xi)).exp(),
            FitModel::Lcpl => {
                let [b0, b1] = self.basis_row(xi, exponents);
                c0 * b0 + c1 * b1
            }
        }
    }

    /// Classifies a coefficient pair taken from a solved coefficient matrix.
    pub fn classify(&self, c0: f64, c1: f64) -> PixelFit {
        if *self == FitModel::NoFit || (self.has_zero_sentinel() && c0 == 0.0 && c1 == 0.0) {
            PixelFit::Unfit
        } else {
            PixelFit::Fit { c0, c1 }
        }
    }
}

impl Display for FitModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FitModel::NoFit => write!(f, "No Fit"),
            FitModel::Constant => write!(f, "Constant"),
            FitModel::Linear => write!(f, "Linear"),
            FitModel::Exponential => write!(f, "Exponential"),
            FitModel::Power => write!(f, "Power Law"),
            FitModel::Lcpl => write!(f, "LCPL"),
        }
    }
}

impl FromStr for FitModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "nofit" | "no-fit" | "no fit" => Ok(FitModel::NoFit),
            "constant" | "const" => Ok(FitModel::Constant),
            "linear" => Ok(FitModel::Linear),
            "exponential" | "exp" => Ok(FitModel::Exponential),
            "power" | "power-law" | "power law" => Ok(FitModel::Power),
            "lcpl" => Ok(FitModel::Lcpl),
            other => {
                let expected: Vec<String> = FitModel::ALL
                    .iter()
                    .map(|model| model.to_string().to_ascii_lowercase())
                    .collect();
                Err(format!(
                    "unknown fit model '{other}' (expected one of: {})",
                    expected.join(", ")
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_no_fit_is_zero_everywhere() {
        for xi in [-10.0, 0.0, 1.5, 1e6] {
            assert_eq!(
                FitModel::NoFit.value_at(PixelFit::Fit { c0: 3.0, c1: 2.0 }, xi, None),
                0.0
            );
            assert_eq!(FitModel::NoFit.value_at(PixelFit::Unfit, xi, None), 0.0);
        }
        assert_eq!(FitModel::NoFit.classify(1.0, 1.0), PixelFit::Unfit);
    }

    #[test]
    fn test_zero_sentinel_only_for_log_domain_models() {
        assert_eq!(FitModel::Power.classify(0.0, 0.0), PixelFit::Unfit);
        assert_eq!(FitModel::Lcpl.classify(0.0, 0.0), PixelFit::Unfit);
        assert_eq!(
            FitModel::Linear.classify(0.0, 0.0),
            PixelFit::Fit { c0: 0.0, c1: 0.0 }
        );
        // exp(0) would be 1, the sentinel must give 0
        let unfit = FitModel::Exponential.classify(0.0, 0.0);
        assert_eq!(FitModel::Exponential.value_at(unfit, 5.0, None), 0.0);
    }

    #[test]
    fn test_log_transforms_floor_non_positive_values() {
        assert_relative_eq!(FitModel::Power.fy(-4.0), LOG_FLOOR.ln());
        assert_relative_eq!(FitModel::Power.fx(0.0), LOG_FLOOR.ln());
        assert_relative_eq!(FitModel::Exponential.fy(0.0), LOG_FLOOR.ln());
        assert_eq!(FitModel::Linear.fy(-4.0), -4.0);
    }

    #[test]
    fn test_lcpl_basis_uses_exponents() {
        let row = FitModel::Lcpl.basis_row(4.0, Some([-1.0, -2.0]));
        assert_relative_eq!(row[0], 0.25);
        assert_relative_eq!(row[1], 0.0625);
        let value = FitModel::Lcpl.value_at(
            PixelFit::Fit { c0: 8.0, c1: 16.0 },
            4.0,
            Some([-1.0, -2.0]),
        );
        assert_relative_eq!(value, 3.0);
    }

    #[test]
    fn test_model_names_parse() {
        for model in FitModel::ALL {
            let token = match model {
                FitModel::NoFit => "none",
                FitModel::Constant => "constant",
                FitModel::Linear => "linear",
                FitModel::Exponential => "exp",
                FitModel::Power => "power",
                FitModel::Lcpl => "LCPL",
            };
            assert_eq!(token.parse::<FitModel>().unwrap(), model);
            assert_eq!(model.to_string().parse::<FitModel>().unwrap(), model);
        }
        assert!("gaussian".parse::<FitModel>().is_err());
    }
}
