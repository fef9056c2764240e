//! Background subtraction of the whole cube.

use crate::calibration::Calibration;
use crate::data_container::SpectrumImage;
use crate::error::AnalysisError;
use crate::fit::fit_image;
use crate::operators::operator::{
    AnalysisOutput, Operator, OperatorConfig, OperatorKind, ProgressSink,
};
use crate::request::AnalysisRequest;
use cancellable_loops::{par_for_each_cancellable, ProgressCounter};
use ndarray::parallel::prelude::*;
use ndarray::{Array3, Axis};
use operator_macros::register_operator;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

/// Subtracts the fitted background from every channel at or after the fit start.
///
/// Channels before the fit start are cleared to zero.
#[register_operator]
#[derive(Clone, Debug)]
pub struct BackgroundSubtraction;

impl Operator for BackgroundSubtraction {
    fn new() -> Self
    where
        Self: Sized,
    {
        BackgroundSubtraction
    }

    fn config(&self) -> OperatorConfig {
        OperatorConfig {
            name: "Background Subtraction".to_string(),
            description: "Fit the background model over the fit window for every pixel and \
                subtract it from all channels from the fit start onward."
                .to_string(),
            hyperlink: None,
            kind: OperatorKind::Subtract,
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
        let (width, height, channels) = input.data.dim();
        request.validate(channels)?;
        progress.report_progress(Some(0.0));

        let x = calibration.axis(channels);
        let fit = fit_image(
            request.model,
            input,
            x.view(),
            request.effective_fit_window(),
            request.lcpl_percentiles,
        );
        let unfit = fit.unfit_count();
        if unfit > 0 && !fit.window.is_empty() {
            log::warn!("{unfit} of {} pixels have no usable background", fit.pixel_count());
        }

        let fit_start = request.fit_window.start;
        let mut output = Array3::<f32>::zeros((width, height, channels));
        let counter = ProgressCounter::new(width);
        let outcome = par_for_each_cancellable(
            output.axis_iter_mut(Axis(0)).into_par_iter().enumerate(),
            abort_flag,
            |(column, mut plane)| {
                for row in 0..height {
                    let pixel = row * width + column;
                    let pixel_fit = fit.pixel_fit(pixel);
                    for channel in fit_start..channels {
                        let background =
                            fit.model.value_at(pixel_fit, x[channel], fit.exponents);
                        plane[(row, channel)] =
                            (input.data[(column, row, channel)] as f64 - background) as f32;
                    }
                }
                progress.report_progress(Some(counter.tick()));
            },
        );
        if outcome.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        progress.report_progress(None);
        log::info!(
            "subtracted {} background from {} pixels in {:?}",
            fit.model,
            width * height,
            start.elapsed()
        );
        Ok(AnalysisOutput::Subtracted {
            cube: input.with_data(output),
            fit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::model::FitModel;
    use crate::request::ChannelWindow;
    use approx::assert_relative_eq;

    fn cube() -> SpectrumImage {
        SpectrumImage::from_map(Array3::from_shape_fn((3, 2, 40), |(x, y, c)| {
            (1.0 + x as f32 + 2.0 * y as f32) * 1e4 / ((c + 100) as f32).powi(2)
                + if c == 30 { 5.0 } else { 0.0 }
        }))
    }

    fn subtract(input: &SpectrumImage, request: &AnalysisRequest) -> SpectrumImage {
        let output = BackgroundSubtraction::new()
            .apply(
                input,
                &Calibration::new(1.0, -100.0, "eV"),
                request,
                &(),
                &AtomicBool::new(false),
            )
            .unwrap();
        match output {
            AnalysisOutput::Subtracted { cube, .. } => cube,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_no_fit_from_channel_zero_is_identity() {
        let input = cube();
        let request = AnalysisRequest {
            model: FitModel::NoFit,
            fit_window: ChannelWindow::new(0, 10),
            ..AnalysisRequest::default()
        };
        let output = subtract(&input, &request);
        assert_eq!(output.data, input.data);
    }

    #[test]
    fn test_power_background_is_removed_and_leading_channels_cleared() {
        let input = cube();
        let request = AnalysisRequest {
            model: FitModel::Power,
            fit_window: ChannelWindow::new(5, 25),
            ..AnalysisRequest::default()
        };
        let output = subtract(&input, &request);
        for pixel in 0..input.pixel_count() {
            for channel in 0..5 {
                assert_eq!(output.channel_at(pixel, channel), 0.0);
            }
            for channel in 5..40 {
                let expected = if channel == 30 { 5.0 } else { 0.0 };
                assert_relative_eq!(
                    output.channel_at(pixel, channel),
                    expected,
                    epsilon = 1e-3
                );
            }
        }
    }

    #[test]
    fn test_cancelled_subtraction() {
        let result = BackgroundSubtraction::new().apply(
            &cube(),
            &Calibration::default(),
            &AnalysisRequest::default(),
            &(),
            &AtomicBool::new(true),
        );
        assert!(matches!(result, Err(AnalysisError::Cancelled)));
    }
}
