//! The analysis session: one loaded image, its calibration and the results derived from them.
//!
//! A session moves through `Idle → FitConfigured → {Subtracted | Integrated | PcaComputed}` and
//! from `PcaComputed` on to `Reconstructed`. Changing the request or the calibration drops every
//! derived result; nothing is updated incrementally.

use crate::calibration::{Calibration, Recalibration};
use crate::data_container::SpectrumImage;
use crate::error::AnalysisError;
use crate::operators::operator::{operator_for, AnalysisOutput, OperatorKind, ProgressSink};
use crate::pca::PcaResult;
use crate::request::AnalysisRequest;
use ndarray::{s, Array2};
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No request has been accepted for the loaded image (or no image is loaded).
    Idle,
    /// Windows and model are set, nothing has been computed yet.
    FitConfigured,
    Subtracted,
    Integrated,
    PcaComputed,
    Reconstructed,
}

impl SessionState {
    fn after(kind: OperatorKind) -> SessionState {
        match kind {
            OperatorKind::Subtract => SessionState::Subtracted,
            OperatorKind::Integrate | OperatorKind::HcmIntegrate => SessionState::Integrated,
            OperatorKind::PrincipalComponents => SessionState::PcaComputed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisSession {
    image: Option<SpectrumImage>,
    calibration: Calibration,
    request: AnalysisRequest,
    state: SessionState,
    pca: Option<PcaResult>,
    output: Option<AnalysisOutput>,
}

impl AnalysisSession {
    pub fn new(calibration: Calibration) -> Self {
        AnalysisSession {
            image: None,
            calibration,
            request: AnalysisRequest::default(),
            state: SessionState::Idle,
            pca: None,
            output: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn request(&self) -> &AnalysisRequest {
        &self.request
    }

    /// The result of the last successful operation.
    pub fn output(&self) -> Option<&AnalysisOutput> {
        self.output.as_ref()
    }

    pub fn pca(&self) -> Option<&PcaResult> {
        self.pca.as_ref()
    }

    fn invalidate(&mut self) {
        self.pca = None;
        self.output = None;
    }

    fn loaded_image(&self, operation: &'static str) -> Result<&SpectrumImage, AnalysisError> {
        self.image.as_ref().ok_or(AnalysisError::InvalidState {
            operation,
            state: self.state,
        })
    }

    /// Replaces the image; the session returns to `Idle`.
    pub fn load(&mut self, image: SpectrumImage) {
        log::info!(
            "loaded {:?} image {}x{} with {} channels, {:.0} counts in total",
            image.rank,
            image.width(),
            image.height(),
            image.channel_count(),
            image.sum_spectrum().sum()
        );
        self.image = Some(image);
        self.state = SessionState::Idle;
        self.invalidate();
    }

    /// Accepts a new request.
    ///
    /// A request that only changes the reconstruction rank or the calibration channels keeps the
    /// current results. Any other request is validated and moves the session back to
    /// `FitConfigured`.
    pub fn configure(&mut self, request: AnalysisRequest) -> Result<(), AnalysisError> {
        let channels = self.loaded_image("configure")?.channel_count();
        if self.state != SessionState::Idle && request.computes_same_as(&self.request) {
            self.request = request;
            return Ok(());
        }
        request.validate(channels)?;
        self.request = request;
        self.state = SessionState::FitConfigured;
        self.invalidate();
        Ok(())
    }

    /// Runs the operator performing `kind` with the current request.
    ///
    /// On failure or cancellation the session keeps its previous state and results.
    pub fn run(
        &mut self,
        kind: OperatorKind,
        progress: &dyn ProgressSink,
        abort_flag: &AtomicBool,
    ) -> Result<&AnalysisOutput, AnalysisError> {
        let image = self.loaded_image("run")?;
        if self.state == SessionState::Idle {
            return Err(AnalysisError::InvalidState {
                operation: "run",
                state: self.state,
            });
        }
        let operator = operator_for(kind)?;
        let config = operator.config();
        log::info!("running {}", config.name);
        log::debug!("{}", config.description);
        if let Some((label, url)) = &config.hyperlink {
            log::debug!("see {} {url}", label.as_deref().unwrap_or_default());
        }
        let output = operator.apply(image, &self.calibration, &self.request, progress, abort_flag)?;

        self.pca = match &output {
            AnalysisOutput::Components(result) => Some(result.clone()),
            _ => None,
        };
        self.state = SessionState::after(kind);
        Ok(self.output.insert(output))
    }

    /// Rebuilds the cube from the first `components` principal components.
    ///
    /// Channels outside the PCA window are zero in the reconstructed cube.
    pub fn reconstruct(&mut self, components: usize) -> Result<&AnalysisOutput, AnalysisError> {
        let image = self.loaded_image("reconstruct")?;
        let pca = match (&self.pca, self.state) {
            (Some(pca), SessionState::PcaComputed | SessionState::Reconstructed) => pca,
            _ => {
                return Err(AnalysisError::InvalidState {
                    operation: "reconstruct",
                    state: self.state,
                })
            }
        };

        let window = pca.reconstruct(components)?;
        let mut full = Array2::zeros((image.channel_count(), image.pixel_count()));
        full.slice_mut(s![self.request.pca_window.range(), ..])
            .assign(&window);
        let cube = image.with_data(image.cube_from_matrix(&full)?);

        log::info!("reconstructed the PCA window from {components} components");
        self.state = SessionState::Reconstructed;
        Ok(self.output.insert(AnalysisOutput::Reconstructed { cube, components }))
    }

    /// Remaps the energy axis. Derived results no longer match the axis and are dropped.
    pub fn recalibrate(&mut self, recalibration: &Recalibration) -> Result<(), AnalysisError> {
        let channels = self.loaded_image("recalibrate")?.channel_count();
        self.calibration.recalibrate(recalibration, channels)?;
        if self.state != SessionState::Idle {
            self.state = SessionState::FitConfigured;
        }
        self.invalidate();
        Ok(())
    }
}
