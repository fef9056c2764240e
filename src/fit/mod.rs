//! Background fitting.
//!
//! * `model`: the closed set of background models and their linearizing transforms.
//! * `least_squares`: the single SVD-based solve shared by all models.
//! * `batched`: per-pixel rescaling of a precomputed background model.

pub mod batched;
pub mod least_squares;
pub mod model;

use crate::data_container::SpectrumImage;
use crate::math_tools::percentile;
use crate::request::ChannelWindow;
use model::{FitModel, PixelFit};
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};

/// Outcome of fitting one background model to every pixel.
///
/// # Fields
/// - `model`: the fitted model.
/// - `window`: channels the fit was computed over (indices into the x-axis used for fitting).
/// - `exponents`: the two power-law exponents chosen for LCPL.
/// - `coefficients`: `(2 × pixels)`; the second row is zero for models with one parameter.
/// - `residual`: `basis · coefficients − fy(observed)` over the window, `(window × pixels)`.
/// - `solved`: `false` if the solve fell back to the zero background.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub model: FitModel,
    pub window: ChannelWindow,
    pub exponents: Option<[f64; 2]>,
    pub coefficients: Array2<f64>,
    pub residual: Array2<f64>,
    pub solved: bool,
}

impl FitResult {
    /// An all-`Unfit` result, used for `NoFit` and for empty windows.
    pub fn unfit(model: FitModel, window: ChannelWindow, targets: &Array2<f64>) -> Self {
        FitResult {
            model,
            window,
            exponents: None,
            coefficients: Array2::zeros((2, targets.ncols())),
            residual: -targets,
            solved: false,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.coefficients.ncols()
    }

    pub fn pixel_fit(&self, pixel: usize) -> PixelFit {
        if !self.solved {
            return PixelFit::Unfit;
        }
        self.model
            .classify(self.coefficients[(0, pixel)], self.coefficients[(1, pixel)])
    }

    /// Background of `pixel` at energy `xi`.
    pub fn value_at(&self, pixel: usize, xi: f64) -> f64 {
        self.model
            .value_at(self.pixel_fit(pixel), xi, self.exponents)
    }

    /// Background of every pixel over `window`, shaped `(window channels × pixels)`.
    ///
    /// `x` is the full calibrated axis, `window` indexes into it.
    pub fn evaluate(&self, x: ArrayView1<f64>, window: ChannelWindow) -> Array2<f64> {
        let pixels = self.pixel_count();
        let fits: Vec<PixelFit> = (0..pixels).map(|p| self.pixel_fit(p)).collect();
        Array2::from_shape_fn((window.len(), pixels), |(row, pixel)| {
            self.model
                .value_at(fits[pixel], x[window.start + row], self.exponents)
        })
    }

    /// Root mean square of the residual over all pixels and window channels, in the
    /// linearized domain of the model. Zero for an empty window.
    pub fn residual_rms(&self) -> f64 {
        if self.residual.is_empty() {
            return 0.0;
        }
        self.residual.mapv(|r| r * r).mean().unwrap_or(0.0).sqrt()
    }

    /// Number of pixels without a usable background.
    pub fn unfit_count(&self) -> usize {
        (0..self.pixel_count())
            .filter(|p| self.pixel_fit(*p) == PixelFit::Unfit)
            .count()
    }
}

fn linearized_targets(model: FitModel, y: &ArrayView2<f64>) -> Array2<f64> {
    y.mapv(|yi| model.fy(yi))
}

fn basis_matrix(model: FitModel, x: &ArrayView1<f64>, exponents: Option<[f64; 2]>) -> Array2<f64> {
    let terms = model.parameter_count();
    Array2::from_shape_fn((x.len(), terms), |(row, term)| {
        model.basis_row(x[row], exponents)[term]
    })
}

/// Fits `model` to every pixel over `window`.
///
/// `x` and the rows of `y` must be aligned (`y[channel][pixel]` is observed at `x[channel]`);
/// `window` selects the fitted channels from both. An empty window or `NoFit` yields an
/// all-`Unfit` result, so callers can treat "no background" uniformly.
///
/// # Arguments
/// - `model`: The background model.
/// - `x`: Calibrated channel positions.
/// - `y`: Observed counts, `(channels × pixels)`.
/// - `window`: Channels used for the fit.
/// - `lcpl_percentiles`: Percentiles picking the two LCPL exponents.
pub fn create_fit(
    model: FitModel,
    x: ArrayView1<f64>,
    y: ArrayView2<f64>,
    window: ChannelWindow,
    lcpl_percentiles: [f64; 2],
) -> FitResult {
    let x_window = x.slice(s![window.range()]);
    let y_window = y.slice(s![window.range(), ..]);

    if window.is_empty() || model == FitModel::NoFit {
        return FitResult::unfit(model, window, &y_window.to_owned());
    }

    let exponents = if model == FitModel::Lcpl {
        match lcpl_exponents(x, y, window, lcpl_percentiles) {
            Some(exponents) => Some(exponents),
            None => {
                log::warn!("no power-law exponents available for LCPL, using zero background");
                return FitResult::unfit(model, window, &y_window.to_owned());
            }
        }
    } else {
        None
    };

    let basis = basis_matrix(model, &x_window, exponents);
    let targets = linearized_targets(model, &y_window);
    let solution = least_squares::solve(&basis, &targets);

    let mut coefficients = Array2::zeros((2, targets.ncols()));
    coefficients
        .slice_mut(s![..solution.coefficients.nrows(), ..])
        .assign(&solution.coefficients);

    FitResult {
        model,
        window,
        exponents,
        coefficients,
        residual: solution.residual,
        solved: solution.solved,
    }
}

/// Chooses the LCPL exponents from the per-pixel power-law exponent distribution.
///
/// The second exponent is clamped to be non-positive. Pixels whose power-law fit is `Unfit`
/// do not contribute.
fn lcpl_exponents(
    x: ArrayView1<f64>,
    y: ArrayView2<f64>,
    window: ChannelWindow,
    [low, high]: [f64; 2],
) -> Option<[f64; 2]> {
    let power = create_fit(FitModel::Power, x, y, window, [low, high]);
    if !power.solved {
        return None;
    }
    let slopes: Vec<f64> = power
        .coefficients
        .axis_iter(Axis(1))
        .filter(|c| FitModel::Power.classify(c[0], c[1]) != PixelFit::Unfit)
        .map(|c| c[1])
        .collect();
    let r1 = percentile(&slopes, low)?;
    let r2 = percentile(&slopes, high)?.min(0.0);
    log::debug!("LCPL exponents: {r1:.4}, {r2:.4}");
    Some([r1, r2])
}

/// Fits `model` over `window` of a spectrum image against the calibrated axis `x`.
pub fn fit_image(
    model: FitModel,
    image: &SpectrumImage,
    x: ArrayView1<f64>,
    window: ChannelWindow,
    lcpl_percentiles: [f64; 2],
) -> FitResult {
    // only the fitted channels are reshaped, the rest of the cube stays in f32 storage
    let y = image.to_matrix(window);
    let x_window = x.slice(s![window.range()]);
    let local = create_fit(
        model,
        x_window,
        y.view(),
        ChannelWindow::new(0, window.len()),
        lcpl_percentiles,
    );
    log::debug!(
        "{model} fit over {window}: residual RMS {:.4e}, {} of {} pixels unfit",
        local.residual_rms(),
        local.unfit_count(),
        local.pixel_count()
    );
    FitResult { window, ..local }
}
