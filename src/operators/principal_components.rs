//! Principal component decomposition of the background-removed PCA window.

use crate::calibration::Calibration;
use crate::data_container::SpectrumImage;
use crate::error::AnalysisError;
use crate::fit::fit_image;
use crate::operators::operator::{
    AnalysisOutput, Operator, OperatorConfig, OperatorKind, ProgressSink,
};
use crate::pca::{principal_components, PcaOptions};
use crate::request::AnalysisRequest;
use operator_macros::register_operator;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

/// Fits the background over the fit window, removes it from the PCA window and decomposes the
/// residual with an (optionally weighted) SVD.
#[register_operator]
#[derive(Clone, Debug)]
pub struct PrincipalComponents;

impl Operator for PrincipalComponents {
    fn new() -> Self
    where
        Self: Sized,
    {
        PrincipalComponents
    }

    fn config(&self) -> OperatorConfig {
        OperatorConfig {
            name: "Principal Components".to_string(),
            description: "Decompose the background-removed PCA window into component maps and \
                spectra, optionally with Poisson noise weighting."
                .to_string(),
            hyperlink: Some((
                Some("Keenan & Kotula (2004)".to_string()),
                "https://doi.org/10.1002/sia.1657".to_string(),
            )),
            kind: OperatorKind::PrincipalComponents,
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
        if request.pca_window.is_empty() {
            return Err(AnalysisError::EmptyPcaWindow);
        }
        progress.report_progress(Some(0.0));

        let x = calibration.axis(input.channel_count());
        let fit = fit_image(
            request.model,
            input,
            x.view(),
            request.effective_fit_window(),
            request.lcpl_percentiles,
        );
        let mut y = input.to_matrix(request.pca_window);
        y -= &fit.evaluate(x.view(), request.pca_window);
        progress.report_progress(Some(0.2));

        let options = PcaOptions {
            mean_centering: request.mean_centering,
            weighted: request.weighted_pca,
            scree_constant: request.scree_constant,
            svd_max_iterations: request.svd_max_iterations,
        };
        let result = principal_components(&y, input.width(), input.height(), options, abort_flag)?;

        progress.report_progress(None);
        log::info!(
            "{} PCA of window {} ({} components) in {:?}",
            if options.weighted { "weighted" } else { "unweighted" },
            request.pca_window,
            result.component_count(),
            start.elapsed()
        );
        if let Some(leading) = result.explained_variance().first() {
            log::debug!("first component carries {:.1} % of the variance", leading * 100.0);
        }
        Ok(AnalysisOutput::Components(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::model::FitModel;
    use crate::request::ChannelWindow;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn input() -> SpectrumImage {
        SpectrumImage::from_map(Array3::from_shape_fn((4, 3, 30), |(x, y, c)| {
            let peak = if (15..20).contains(&c) {
                (x + 2 * y) as f32 * (1.0 + (c - 15) as f32)
            } else {
                0.0
            };
            20.0 + peak
        }))
    }

    #[test]
    fn test_background_is_removed_before_decomposition() {
        let input = input();
        let request = AnalysisRequest {
            model: FitModel::Constant,
            fit_window: ChannelWindow::new(0, 10),
            pca_window: ChannelWindow::new(12, 22),
            weighted_pca: true,
            ..AnalysisRequest::default()
        };
        let output = PrincipalComponents::new()
            .apply(
                &input,
                &Calibration::default(),
                &request,
                &(),
                &AtomicBool::new(false),
            )
            .unwrap();
        let AnalysisOutput::Components(result) = output else {
            panic!("unexpected output");
        };
        assert_eq!(result.spectra.nrows(), 10);
        assert_eq!(result.maps.ncols(), 12);

        // the residual peak has rank one
        assert!(result.singular_values[1] < 1e-8 * result.singular_values[0]);
        let rebuilt = result.reconstruct(1).unwrap();
        let pixel = 2 * 4 + 3;
        assert_abs_diff_eq!(rebuilt[(3, pixel)], (3 + 4) as f64 * 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(rebuilt[(0, pixel)], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_empty_pca_window_is_rejected() {
        let result = PrincipalComponents::new().apply(
            &input(),
            &Calibration::default(),
            &AnalysisRequest::default(),
            &(),
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(AnalysisError::EmptyPcaWindow)));
    }
}
