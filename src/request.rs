//! The immutable parameter set that every operator receives.
//!
//! An `AnalysisRequest` replaces the window positions, model selection and checkbox states an
//! interactive front end would otherwise keep in mutable globals. Operators never read anything
//! else, so the same request always produces the same result for the same cube.

use crate::error::AnalysisError;
use crate::fit::model::FitModel;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Range;

/// A half-open channel window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelWindow {
    pub start: usize,
    pub end: usize,
}

impl ChannelWindow {
    pub fn new(start: usize, end: usize) -> Self {
        ChannelWindow { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end.max(self.start)
    }

    pub fn contains(&self, channel: usize) -> bool {
        self.range().contains(&channel)
    }

    /// Smallest window covering both `self` and `other`. Empty windows do not widen the result.
    pub fn union(&self, other: &ChannelWindow) -> ChannelWindow {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => *self,
            (true, false) => *other,
            (false, true) => *self,
            (false, false) => {
                ChannelWindow::new(self.start.min(other.start), self.end.max(other.end))
            }
        }
    }

    /// Checks `0 <= start <= end <= channel_count`.
    pub fn validate(&self, name: &'static str, channel_count: usize) -> Result<(), AnalysisError> {
        if self.start > self.end || self.end > channel_count {
            return Err(AnalysisError::InvalidWindow {
                name,
                start: self.start,
                end: self.end,
                channel_count,
            });
        }
        Ok(())
    }
}

impl Display for ChannelWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// All parameters of one analysis call.
///
/// # Fields
/// - `model`: background model fitted over `fit_window`.
/// - `fit_window`: channels used to estimate the background.
/// - `integration_window`: channels summed by the integration operators.
/// - `calibration_channels`: closed channel pair `[cX0, cX1]` offered to two-point recalibration.
/// - `pca_window`: channels entering the principal component analysis.
/// - `mean_centering`: subtract the per-channel mean before the SVD.
/// - `weighted_pca`: apply Poisson noise weighting before the SVD.
/// - `oversampling_fwhm`: FWHM in pixels of the spatial blur used to stabilize the fit (0 = off).
/// - `lcpl_percentiles`: low/high percentiles picking the two LCPL exponents.
/// - `components`: number of components used by the reconstruction filter.
/// - `scree_constant`: the constant `c` of the scree transform `ln(1 + c·σ/σmax)`.
/// - `svd_max_iterations`: iteration cap of the SVD, 0 picks one from the matrix size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub model: FitModel,
    pub fit_window: ChannelWindow,
    pub integration_window: ChannelWindow,
    pub calibration_channels: [usize; 2],
    pub pca_window: ChannelWindow,
    pub mean_centering: bool,
    pub weighted_pca: bool,
    pub oversampling_fwhm: f64,
    pub lcpl_percentiles: [f64; 2],
    pub components: usize,
    pub scree_constant: f64,
    pub svd_max_iterations: usize,
}

impl Default for AnalysisRequest {
    fn default() -> Self {
        AnalysisRequest {
            model: FitModel::Power,
            fit_window: ChannelWindow::new(0, 0),
            integration_window: ChannelWindow::new(0, 0),
            calibration_channels: [0, 1],
            pca_window: ChannelWindow::new(0, 0),
            mean_centering: false,
            weighted_pca: false,
            oversampling_fwhm: 0.0,
            lcpl_percentiles: [20.0, 80.0],
            components: 1,
            scree_constant: 1e4,
            svd_max_iterations: 0,
        }
    }
}

impl AnalysisRequest {
    /// Validates every window against the cube and the numeric parameters against their ranges.
    pub fn validate(&self, channel_count: usize) -> Result<(), AnalysisError> {
        self.fit_window.validate("fit", channel_count)?;
        self.integration_window
            .validate("integration", channel_count)?;
        self.pca_window.validate("PCA", channel_count)?;
        let [low, high] = self.lcpl_percentiles;
        if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) || low > high {
            return Err(AnalysisError::InvalidPercentiles { low, high });
        }
        if !self.oversampling_fwhm.is_finite() || self.oversampling_fwhm < 0.0 {
            return Err(AnalysisError::InvalidOversampling(self.oversampling_fwhm));
        }
        if !self.scree_constant.is_finite() || self.scree_constant <= 0.0 {
            return Err(AnalysisError::InvalidScreeConstant(self.scree_constant));
        }
        Ok(())
    }

    /// Whether `other` yields the same fits, integrals and decomposition.
    ///
    /// `components` and `calibration_channels` only parameterize later steps and are ignored.
    pub fn computes_same_as(&self, other: &AnalysisRequest) -> bool {
        let aligned = AnalysisRequest {
            components: other.components,
            calibration_channels: other.calibration_channels,
            ..self.clone()
        };
        aligned == *other
    }

    /// The fit window, collapsed to an empty window when the model is `NoFit`.
    pub fn effective_fit_window(&self) -> ChannelWindow {
        if self.model == FitModel::NoFit {
            ChannelWindow::new(self.fit_window.start, self.fit_window.start)
        } else {
            self.fit_window
        }
    }
}
