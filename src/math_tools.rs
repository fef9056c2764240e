//! Numerical helpers shared by the operators: floored logarithms, percentiles, trapezoid weights
//! for windowed sums and the separable spatial Gaussian used to oversample a cube before fitting.

use crate::fit::model::LOG_FLOOR;
use crate::request::ChannelWindow;
use ndarray::{Array1, Array3, Zip};

/// Natural logarithm with the argument floored at [`LOG_FLOOR`].
///
/// Keeps zero or negative counts from turning into `NaN`/`-inf` in the log-domain fits.
pub fn floored_ln(value: f64) -> f64 {
    value.max(LOG_FLOOR).ln()
}

/// Computes a percentile with linear interpolation between the closest ranks.
///
/// Non-finite values are ignored.
///
/// # Arguments
/// - `values`: The samples.
/// - `percentile`: The percentile in `0.0..=100.0`.
///
/// # Returns
/// The interpolated percentile, or `None` if there is no finite sample.
pub fn percentile(values: &[f64], percentile: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (percentile.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Trapezoid weights for summing a background-subtracted signal over an integration window.
///
/// The sum runs from channel `window.start` to channel `window.end` (clamped to the last
/// channel). Both endpoints carry half weight and interior channels full weight, so a flat
/// signal of height `H` integrates to `H` per channel step. A window that collapses onto a
/// single channel returns that channel with full weight, an empty window returns no weights.
///
/// # Arguments
/// - `window`: The integration window.
/// - `channel_count`: Number of channels of the spectrum.
///
/// # Returns
/// `(channel, weight)` pairs in ascending channel order.
pub fn trapezoid_weights(window: ChannelWindow, channel_count: usize) -> Vec<(usize, f64)> {
    if window.is_empty() || channel_count == 0 || window.start >= channel_count {
        return vec![];
    }
    let first = window.start;
    let last = window.end.min(channel_count - 1);
    if last == first {
        return vec![(first, 1.0)];
    }
    let mut weights = Vec::with_capacity(last - first + 1);
    weights.push((first, 0.5));
    weights.extend((first + 1..last).map(|channel| (channel, 1.0)));
    weights.push((last, 0.5));
    weights
}

/// Smallest channel window covering every channel that carries a weight.
pub fn weights_cover(weights: &[(usize, f64)]) -> ChannelWindow {
    match (weights.first(), weights.last()) {
        (Some((first, _)), Some((last, _))) => ChannelWindow::new(*first, last + 1),
        _ => ChannelWindow::new(0, 0),
    }
}

/// Normalized Gaussian kernel for the given FWHM in pixels, truncated at three sigma.
pub fn gaussian_kernel(fwhm: f64) -> Array1<f64> {
    let sigma = fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let kernel = Array1::from_shape_fn(2 * radius + 1, |i| {
        let d = i as f64 - radius as f64;
        (-0.5 * (d / sigma).powi(2)).exp()
    });
    let sum = kernel.sum();
    kernel / sum
}

/// Blurs every channel of a `(x, y, channel)` cube with a separable spatial Gaussian.
///
/// Edges are handled by clamping to the border pixel. A non-positive `fwhm` returns an unmodified
/// copy.
///
/// # Arguments
/// - `data`: The cube to blur.
/// - `fwhm`: Full width at half maximum of the Gaussian in pixels.
///
/// # Returns
/// The blurred cube with the same shape as `data`.
pub fn gaussian_blur_spatial(data: &Array3<f32>, fwhm: f64) -> Array3<f32> {
    if fwhm <= 0.0 || data.is_empty() {
        return data.clone();
    }
    let kernel = gaussian_kernel(fwhm);
    let along_x = convolve_spatial_axis(data, &kernel, 0);
    convolve_spatial_axis(&along_x, &kernel, 1)
}

fn convolve_spatial_axis(data: &Array3<f32>, kernel: &Array1<f64>, axis: usize) -> Array3<f32> {
    let (width, height, _) = data.dim();
    let radius = (kernel.len() / 2) as isize;
    let mut output = Array3::<f32>::zeros(data.dim());
    Zip::indexed(&mut output).par_for_each(|(x, y, channel), out| {
        let mut acc = 0.0;
        for (k, weight) in kernel.iter().enumerate() {
            let offset = k as isize - radius;
            let (xs, ys) = if axis == 0 {
                ((x as isize + offset).clamp(0, width as isize - 1) as usize, y)
            } else {
                (x, (y as isize + offset).clamp(0, height as isize - 1) as usize)
            };
            acc += weight * data[(xs, ys, channel)] as f64;
        }
        *out = acc as f32;
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_percentile_interpolates() {
        let values = [5.0, 1.0, 3.0, 2.0, 4.0, f64::NAN];
        assert_relative_eq!(percentile(&values, 0.0).unwrap(), 1.0);
        assert_relative_eq!(percentile(&values, 50.0).unwrap(), 3.0);
        assert_relative_eq!(percentile(&values, 20.0).unwrap(), 1.8);
        assert_relative_eq!(percentile(&values, 100.0).unwrap(), 5.0);
        assert!(percentile(&[f64::NAN], 50.0).is_none());
    }

    #[test]
    fn test_trapezoid_weights_half_weight_endpoints() {
        let weights = trapezoid_weights(ChannelWindow::new(2, 5), 10);
        assert_eq!(weights, vec![(2, 0.5), (3, 1.0), (4, 1.0), (5, 0.5)]);
        assert_eq!(weights_cover(&weights), ChannelWindow::new(2, 6));

        // the closing endpoint is clamped to the last channel
        let clamped = trapezoid_weights(ChannelWindow::new(7, 10), 10);
        assert_eq!(clamped, vec![(7, 0.5), (8, 1.0), (9, 0.5)]);

        assert_eq!(
            trapezoid_weights(ChannelWindow::new(9, 10), 10),
            vec![(9, 1.0)]
        );
        assert!(trapezoid_weights(ChannelWindow::new(4, 4), 10).is_empty());
    }

    #[test]
    fn test_gaussian_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(2.0);
        assert_relative_eq!(kernel.sum(), 1.0, epsilon = 1e-12);
        let n = kernel.len();
        for i in 0..n / 2 {
            assert_relative_eq!(kernel[i], kernel[n - 1 - i], epsilon = 1e-15);
        }
    }

    #[test]
    fn test_blur_preserves_flat_cube_and_spreads_impulse() {
        let flat = Array3::<f32>::from_elem((5, 4, 3), 2.0);
        let blurred = gaussian_blur_spatial(&flat, 1.5);
        for v in blurred.iter() {
            assert_relative_eq!(*v, 2.0, epsilon = 1e-5);
        }

        let mut impulse = Array3::<f32>::zeros((7, 7, 1));
        impulse[(3, 3, 0)] = 1.0;
        let spread = gaussian_blur_spatial(&impulse, 2.0);
        assert!(spread[(3, 3, 0)] < 1.0);
        assert!(spread[(2, 3, 0)] > 0.0);
        assert_relative_eq!(spread.sum(), 1.0, epsilon = 1e-4);

        assert_eq!(gaussian_blur_spatial(&impulse, 0.0), impulse);
    }
}
