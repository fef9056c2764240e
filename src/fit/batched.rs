//! Per-pixel rescaling of a precomputed background model.
//!
//! Instead of a full two-parameter solve for every pixel, a background shape is evaluated once per
//! pixel over the union of the background and edge windows (`create_model`). `fit_model` then only
//! solves the one-parameter regression `scale · model ≈ observed` over the background window and
//! sums the rescaled, background-subtracted signal over the edge window.

use crate::data_container::SpectrumImage;
use crate::fit::FitResult;
use crate::request::ChannelWindow;
use cancellable_loops::{par_map_cancellable, ProgressCounter};
use ndarray::{Array1, Array2, ArrayView1};
use std::sync::atomic::AtomicBool;

/// A background shape per pixel over a contiguous channel window.
///
/// # Fields
/// - `window`: channels covered by the model.
/// - `values`: `(window channels × pixels)` background values.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    pub window: ChannelWindow,
    pub values: Array2<f64>,
}

impl BackgroundModel {
    /// Model value of `pixel` at `channel`, zero outside the model window.
    pub fn value(&self, pixel: usize, channel: usize) -> f64 {
        if self.window.contains(channel) {
            self.values[(channel - self.window.start, pixel)]
        } else {
            0.0
        }
    }
}

/// Per-pixel output of [`fit_model`].
///
/// # Fields
/// - `scale`: factor applied to the model of each pixel.
/// - `net_signal`: weighted sum of `observed − scale · model` over the edge channels.
#[derive(Debug, Clone)]
pub struct ScaledModelFit {
    pub scale: Array1<f64>,
    pub net_signal: Array1<f64>,
}

/// Evaluates `fit` for every pixel over the union of `background` and `edge`.
pub fn create_model(
    fit: &FitResult,
    x: ArrayView1<f64>,
    background: ChannelWindow,
    edge: ChannelWindow,
) -> BackgroundModel {
    let window = background.union(&edge);
    BackgroundModel {
        window,
        values: fit.evaluate(x, window),
    }
}

/// Least-squares scale of `model` against `observed`, zero if the model vanishes.
fn scale_factor(model: &[f64], observed: &[f64]) -> f64 {
    let (numerator, denominator) = model
        .iter()
        .zip(observed)
        .fold((0.0, 0.0), |(num, den), (b, y)| (num + b * y, den + b * b));
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Rescales the model of every pixel to the raw data and sums the net edge signal.
///
/// # Arguments
/// - `model`: Background shapes from [`create_model`].
/// - `image`: The raw spectrum image.
/// - `background`: Channels used to determine the scale.
/// - `edge_weights`: `(channel, weight)` pairs summed into the net signal.
/// - `progress`: Counter ticked once per pixel.
/// - `abort_flag`: Stops the loop early.
///
/// # Returns
/// `None` if the computation was cancelled.
pub fn fit_model(
    model: &BackgroundModel,
    image: &SpectrumImage,
    background: ChannelWindow,
    edge_weights: &[(usize, f64)],
    progress: &ProgressCounter,
    abort_flag: &AtomicBool,
) -> Option<ScaledModelFit> {
    let pairs = par_map_cancellable(0..image.pixel_count(), abort_flag, |pixel| {
        let spectrum = image.spectrum(pixel);
        let basis: Vec<f64> = background
            .range()
            .map(|channel| model.value(pixel, channel))
            .collect();
        let observed: Vec<f64> = background
            .range()
            .map(|channel| spectrum[channel] as f64)
            .collect();
        let scale = scale_factor(&basis, &observed);
        let net = edge_weights
            .iter()
            .map(|(channel, weight)| {
                weight * (spectrum[*channel] as f64 - scale * model.value(pixel, *channel))
            })
            .sum::<f64>();
        progress.tick();
        (scale, net)
    })?;
    let (scale, net_signal): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
    Some(ScaledModelFit {
        scale: Array1::from_vec(scale),
        net_signal: Array1::from_vec(net_signal),
    })
}
