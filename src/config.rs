//! Commands, events and shared state between the front end and the analysis thread, plus the
//! persisted settings.

use crate::calibration::{Calibration, Recalibration};
use crate::operators::operator::{AnalysisOutput, OperatorKind};
use crate::request::AnalysisRequest;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Preferences key of the [`AnalysisSettings`].
pub const SETTINGS_KEY: &str = "config/analysis";

pub enum AnalysisCommand {
    LoadImage(PathBuf),
    Configure(AnalysisRequest),
    Run(OperatorKind),
    Reconstruct(usize),
    Recalibrate(Recalibration),
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    /// An image was loaded, `(width, height, channels)`.
    Loaded([usize; 3]),
    /// A request or recalibration was accepted.
    Configured,
    /// A computation finished, its result is in the output lock.
    Finished(Option<OperatorKind>),
    Failed(String),
    Cancelled,
}

/// Settings persisted between runs.
///
/// # Fields
/// - `request`: default windows, model and PCA options (scree constant, SVD iteration cap).
/// - `calibration`: calibration applied to newly loaded images.
/// - `log_level`: `flexi_logger` specification, e.g. `"info"` or `"spectrum_imager=debug"`.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct AnalysisSettings {
    pub request: AnalysisRequest,
    pub calibration: Calibration,
    pub log_level: String,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        AnalysisSettings {
            request: AnalysisRequest::default(),
            calibration: Calibration::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Channels and locks shared with the analysis thread.
#[derive(Clone)]
pub struct ThreadCommunication {
    pub command_tx: Sender<AnalysisCommand>,
    pub command_rx: Receiver<AnalysisCommand>,
    pub event_tx: Sender<AnalysisEvent>,
    pub event_rx: Receiver<AnalysisEvent>,
    pub progress_lock: Arc<RwLock<Option<f32>>>,
    pub abort_flag: Arc<AtomicBool>,
    pub output_lock: Arc<RwLock<Option<AnalysisOutput>>>,
    pub computation_time_lock: Arc<RwLock<HashMap<OperatorKind, Duration>>>,
    pub settings: AnalysisSettings,
}

impl ThreadCommunication {
    pub fn new(settings: AnalysisSettings) -> Self {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        ThreadCommunication {
            command_tx,
            command_rx,
            event_tx,
            event_rx,
            progress_lock: Arc::new(RwLock::new(None)),
            abort_flag: Arc::new(AtomicBool::new(false)),
            output_lock: Arc::new(RwLock::new(None)),
            computation_time_lock: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }
}

/// Sends a command to the analysis thread.
pub fn send_command(thread_communication: &ThreadCommunication, command: AnalysisCommand) {
    if let Err(err) = thread_communication.command_tx.send(command) {
        log::error!("failed to send command to the analysis thread: {err}");
    }
}

pub(crate) fn send_event(thread_communication: &ThreadCommunication, event: AnalysisEvent) {
    if let Err(err) = thread_communication.event_tx.send(event) {
        log::error!("failed to send analysis event: {err}");
    }
}
