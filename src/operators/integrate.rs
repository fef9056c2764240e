//! Window integration of the background-subtracted signal.
//!
//! Both operators sum over the integration window with trapezoid weights (half weight on the two
//! endpoint channels). With a positive oversampling FWHM the background is fitted on a spatially
//! blurred copy of the cube and rescaled to every raw pixel, otherwise every pixel is fitted on
//! its own.

use crate::calibration::Calibration;
use crate::data_container::SpectrumImage;
use crate::error::AnalysisError;
use crate::fit::batched::{create_model, fit_model, BackgroundModel, ScaledModelFit};
use crate::fit::{fit_image, FitResult};
use crate::math_tools::{gaussian_blur_spatial, trapezoid_weights, weights_cover};
use crate::operators::operator::{
    AnalysisOutput, Operator, OperatorConfig, OperatorKind, ProgressSink,
};
use crate::request::AnalysisRequest;
use cancellable_loops::{par_map_cancellable, ProgressCounter};
use ndarray::{Array1, Array2};
use operator_macros::register_operator;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

/// Background of every pixel, either fitted directly or rescaled from the oversampled fit.
enum Background {
    Direct {
        fit: FitResult,
        x: Array1<f64>,
    },
    Rescaled {
        model: BackgroundModel,
        scaled: ScaledModelFit,
    },
}

impl Background {
    fn value(&self, pixel: usize, channel: usize) -> f64 {
        match self {
            Background::Direct { fit, x } => fit.value_at(pixel, x[channel]),
            Background::Rescaled { model, scaled } => {
                scaled.scale[pixel] * model.value(pixel, channel)
            }
        }
    }
}

fn estimate_background(
    input: &SpectrumImage,
    calibration: &Calibration,
    request: &AnalysisRequest,
    weights: &[(usize, f64)],
    abort_flag: &AtomicBool,
) -> Result<Background, AnalysisError> {
    let x = calibration.axis(input.channel_count());
    let window = request.effective_fit_window();

    if request.oversampling_fwhm > 0.0 && !window.is_empty() {
        let blurred = input.with_data(gaussian_blur_spatial(
            &input.data,
            request.oversampling_fwhm,
        ));
        let fit = fit_image(
            request.model,
            &blurred,
            x.view(),
            window,
            request.lcpl_percentiles,
        );
        let model = create_model(&fit, x.view(), window, weights_cover(weights));
        let counter = ProgressCounter::new(input.pixel_count());
        let scaled = fit_model(&model, input, window, weights, &counter, abort_flag)
            .ok_or(AnalysisError::Cancelled)?;
        log::debug!(
            "rescaled oversampled {} background (FWHM {} px)",
            request.model,
            request.oversampling_fwhm
        );
        Ok(Background::Rescaled { model, scaled })
    } else {
        let fit = fit_image(
            request.model,
            input,
            x.view(),
            window,
            request.lcpl_percentiles,
        );
        Ok(Background::Direct { fit, x })
    }
}

/// Sums `term(pixel, channel, weight)` over the weighted channels of every pixel.
///
/// Rows of the image are processed in parallel and progress is reported once per row, mapped
/// onto `0.5..=1.0`.
fn accumulate<F>(
    input: &SpectrumImage,
    weights: &[(usize, f64)],
    progress: &dyn ProgressSink,
    abort_flag: &AtomicBool,
    term: F,
) -> Result<Array1<f64>, AnalysisError>
where
    F: Fn(usize, usize, f64) -> f64 + Sync + Send,
{
    let (width, height) = (input.width(), input.height());
    let counter = ProgressCounter::new(height);
    let rows = par_map_cancellable(0..height, abort_flag, |row| {
        let sums: Vec<f64> = (0..width)
            .map(|column| {
                let pixel = row * width + column;
                weights
                    .iter()
                    .map(|(channel, weight)| term(pixel, *channel, *weight))
                    .sum()
            })
            .collect();
        progress.report_progress(Some(0.5 + 0.5 * counter.tick()));
        sums
    })
    .ok_or(AnalysisError::Cancelled)?;
    Ok(Array1::from_iter(rows.into_iter().flatten()))
}

/// Net signal of the integration window after background subtraction.
#[register_operator]
#[derive(Clone, Debug)]
pub struct WindowIntegration;

impl Operator for WindowIntegration {
    fn new() -> Self
    where
        Self: Sized,
    {
        WindowIntegration
    }

    fn config(&self) -> OperatorConfig {
        OperatorConfig {
            name: "Window Integration".to_string(),
            description: "Integrate the background-subtracted signal over the integration \
                window with trapezoid weights."
                .to_string(),
            hyperlink: None,
            kind: OperatorKind::Integrate,
        }
    }

    fn apply(
        &self,
        input: &SpectrumImage,
        calibration: &Calibration,
        request: &AnalysisRequest,
        progress: &dyn ProgressSink,
        abort_flag: &AtomicBool,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let start = Instant::now();
        request.validate(input.channel_count())?;
        let weights = trapezoid_weights(request.integration_window, input.channel_count());
        if weights.is_empty() {
            return Ok(AnalysisOutput::Integrated {
                map: Array2::zeros((input.width(), input.height())),
                scale: None,
            });
        }
        progress.report_progress(Some(0.0));

        let background = estimate_background(input, calibration, request, &weights, abort_flag)?;
        progress.report_progress(Some(0.5));

        let (net, scale) = match &background {
            Background::Rescaled { scaled, .. } => (
                scaled.net_signal.clone(),
                Some(input.map_from_pixels(&scaled.scale)?),
            ),
            Background::Direct { .. } => {
                let net = accumulate(
                    input,
                    &weights,
                    progress,
                    abort_flag,
                    |pixel, channel, weight| {
                        let observed = input.channel_at(pixel, channel) as f64;
                        weight * (observed - background.value(pixel, channel))
                    },
                )?;
                (net, None)
            }
        };

        progress.report_progress(None);
        log::info!(
            "integrated window {} of {} pixels in {:?}",
            request.integration_window,
            input.pixel_count(),
            start.elapsed()
        );
        Ok(AnalysisOutput::Integrated {
            map: input.map_from_pixels(&net)?,
            scale,
        })
    }
}

/// Chi-squared style significance of the integration window.
///
/// Accumulates `weight · residual² / observed`, i.e. `residual² / (2·observed)` on the endpoints.
/// A zero observed intensity yields a non-finite pixel, which is kept in the map and counted.
#[register_operator]
#[derive(Clone, Debug)]
pub struct HcmIntegration;

impl Operator for HcmIntegration {
    fn new() -> Self
    where
        Self: Sized,
    {
        HcmIntegration
    }

    fn config(&self) -> OperatorConfig {
        OperatorConfig {
            name: "HCM Integration".to_string(),
            description: "Sum the squared background residual relative to the observed counts \
                over the integration window."
                .to_string(),
            hyperlink: None,
            kind: OperatorKind::HcmIntegrate,
        }
    }

    fn apply(
        &self,
        input: &SpectrumImage,
        calibration: &Calibration,
        request: &AnalysisRequest,
        progress: &dyn ProgressSink,
        abort_flag: &AtomicBool,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let start = Instant::now();
        request.validate(input.channel_count())?;
        let weights = trapezoid_weights(request.integration_window, input.channel_count());
        if weights.is_empty() {
            return Ok(AnalysisOutput::HcmIntegrated {
                map: Array2::zeros((input.width(), input.height())),
                non_finite: 0,
            });
        }
        progress.report_progress(Some(0.0));

        let background = estimate_background(input, calibration, request, &weights, abort_flag)?;
        progress.report_progress(Some(0.5));

        let values = accumulate(
            input,
            &weights,
            progress,
            abort_flag,
            |pixel, channel, weight| {
                let observed = input.channel_at(pixel, channel) as f64;
                let residual = observed - background.value(pixel, channel);
                weight * residual * residual / observed
            },
        )?;

        let non_finite = values.iter().filter(|v| !v.is_finite()).count();
        if non_finite > 0 {
            log::warn!("{non_finite} pixels have zero observed counts in the integration window");
        }

        progress.report_progress(None);
        log::info!(
            "HCM integrated window {} of {} pixels in {:?}",
            request.integration_window,
            input.pixel_count(),
            start.elapsed()
        );
        Ok(AnalysisOutput::HcmIntegrated {
            map: input.map_from_pixels(&values)?,
            non_finite,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::model::FitModel;
    use crate::request::ChannelWindow;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn calibration() -> Calibration {
        Calibration::new(1.0, -100.0, "eV")
    }

    fn run(
        operator: &dyn Operator,
        input: &SpectrumImage,
        request: &AnalysisRequest,
    ) -> AnalysisOutput {
        operator
            .apply(input, &calibration(), request, &(), &AtomicBool::new(false))
            .unwrap()
    }

    /// Flat background of 10 with a pulse of height 5 on channels `30..=40`.
    fn pulse_cube() -> SpectrumImage {
        SpectrumImage::from_map(Array3::from_shape_fn((3, 2, 60), |(_, _, c)| {
            if (30..=40).contains(&c) {
                15.0
            } else {
                10.0
            }
        }))
    }

    #[test]
    fn test_rectangular_pulse_integrates_to_height_times_width() {
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(0, 20),
            integration_window: ChannelWindow::new(30, 40),
            ..AnalysisRequest::default()
        };
        match run(&WindowIntegration::new(), &pulse_cube(), &request) {
            AnalysisOutput::Integrated { map, scale } => {
                assert_eq!(map.dim(), (3, 2));
                assert!(scale.is_none());
                for value in map.iter() {
                    assert_relative_eq!(*value, 5.0 * 10.0, epsilon = 1e-6);
                }
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_pulse_filling_the_window_is_within_one_height() {
        let input = SpectrumImage::from_map(Array3::from_shape_fn((2, 2, 60), |(_, _, c)| {
            if (30..40).contains(&c) {
                15.0
            } else {
                10.0
            }
        }));
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(0, 20),
            integration_window: ChannelWindow::new(30, 40),
            ..AnalysisRequest::default()
        };
        match run(&WindowIntegration::new(), &input, &request) {
            AnalysisOutput::Integrated { map, .. } => {
                for value in map.iter() {
                    assert!((value - 5.0 * 10.0).abs() <= 5.0);
                    // half weight on channel 30, channel 40 carries no pulse
                    assert_relative_eq!(*value, 47.5, epsilon = 1e-6);
                }
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_empty_windows() {
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(0, 20),
            integration_window: ChannelWindow::new(30, 30),
            ..AnalysisRequest::default()
        };
        match run(&WindowIntegration::new(), &pulse_cube(), &request) {
            AnalysisOutput::Integrated { map, .. } => {
                assert!(map.iter().all(|v| *v == 0.0));
            }
            other => panic!("unexpected output {other:?}"),
        }

        // an empty fit window means no background
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(5, 5),
            integration_window: ChannelWindow::new(10, 20),
            ..AnalysisRequest::default()
        };
        match run(&WindowIntegration::new(), &pulse_cube(), &request) {
            AnalysisOutput::Integrated { map, .. } => {
                assert_relative_eq!(map[(1, 1)], 100.0, epsilon = 1e-6);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_oversampled_fit_is_rescaled_to_each_pixel() {
        let input = SpectrumImage::from_map(Array3::from_shape_fn((4, 3, 60), |(x, y, c)| {
            let brightness = 1.0 + x as f32 + 3.0 * y as f32;
            let pulse = if (30..=40).contains(&c) { 5.0 } else { 0.0 };
            brightness * 1e4 / ((c + 100) as f32).powi(2) + pulse
        }));
        let request = AnalysisRequest {
            model: FitModel::Power,
            fit_window: ChannelWindow::new(5, 25),
            integration_window: ChannelWindow::new(30, 40),
            oversampling_fwhm: 2.0,
            ..AnalysisRequest::default()
        };
        match run(&WindowIntegration::new(), &input, &request) {
            AnalysisOutput::Integrated { map, scale } => {
                for value in map.iter() {
                    assert_relative_eq!(*value, 50.0, epsilon = 1e-2);
                }
                let scale = scale.unwrap();
                assert_eq!(scale.dim(), (4, 3));
                assert!(scale[(3, 2)] > scale[(0, 0)]);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_hcm_weights_endpoints_by_half() {
        // background 10, a residual of 4 only on the first integration channel
        let input = SpectrumImage::from_map(Array3::from_shape_fn((2, 2, 50), |(_, _, c)| {
            if c == 30 {
                14.0
            } else {
                10.0
            }
        }));
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(0, 20),
            integration_window: ChannelWindow::new(30, 40),
            ..AnalysisRequest::default()
        };
        match run(&HcmIntegration::new(), &input, &request) {
            AnalysisOutput::HcmIntegrated { map, non_finite } => {
                assert_eq!(non_finite, 0);
                for value in map.iter() {
                    assert_relative_eq!(*value, 16.0 / (2.0 * 14.0), epsilon = 1e-9);
                }
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_hcm_empty_windows() {
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(0, 20),
            integration_window: ChannelWindow::new(30, 30),
            ..AnalysisRequest::default()
        };
        match run(&HcmIntegration::new(), &pulse_cube(), &request) {
            AnalysisOutput::HcmIntegrated { map, non_finite } => {
                assert_eq!(map.dim(), (3, 2));
                assert_eq!(non_finite, 0);
                assert!(map.iter().all(|v| *v == 0.0));
            }
            other => panic!("unexpected output {other:?}"),
        }

        // without a background every observed count is residual
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(5, 5),
            integration_window: ChannelWindow::new(10, 20),
            ..AnalysisRequest::default()
        };
        match run(&HcmIntegration::new(), &pulse_cube(), &request) {
            AnalysisOutput::HcmIntegrated { map, non_finite } => {
                assert_eq!(non_finite, 0);
                for value in map.iter() {
                    assert_relative_eq!(*value, 10.0 * 10.0, epsilon = 1e-6);
                }
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_hcm_zero_observed_is_non_finite() {
        let mut data = Array3::from_elem((2, 1, 20), 4.0f32);
        data[(1, 0, 12)] = 0.0;
        let request = AnalysisRequest {
            model: FitModel::NoFit,
            integration_window: ChannelWindow::new(10, 15),
            ..AnalysisRequest::default()
        };
        match run(&HcmIntegration::new(), &SpectrumImage::from_map(data), &request) {
            AnalysisOutput::HcmIntegrated { map, non_finite } => {
                assert_eq!(non_finite, 1);
                assert!(map[(0, 0)].is_finite());
                assert!(!map[(1, 0)].is_finite());
            }
            other => panic!("unexpected output {other:?}"),
        }
    }
}
