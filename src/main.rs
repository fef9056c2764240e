use crate::calibration::Recalibration;
use crate::config::{
    send_command, AnalysisCommand, AnalysisEvent, AnalysisSettings, ThreadCommunication,
    SETTINGS_KEY,
};
use crate::data_thread::main_thread;
use crate::error::CalibrationError;
use crate::fit::model::FitModel;
use crate::io::save_output;
use crate::operators::operator::{AnalysisOutput, OperatorKind};
use crate::request::{AnalysisRequest, ChannelWindow};
use clap::{Parser, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use flexi_logger::{Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle};
use preferences::{AppInfo, Preferences};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

mod calibration;
mod config;
mod data_container;
mod data_thread;
mod error;
mod fit;
mod io;
mod math_tools;
mod operators;
mod pca;
mod request;
mod session;

const APP_INFO: AppInfo = AppInfo {
    name: "Spectrum Imager",
    author: "Linus Leo Stöckli",
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Operation {
    Subtract,
    Integrate,
    Hcm,
    Pca,
}

impl From<Operation> for OperatorKind {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Subtract => OperatorKind::Subtract,
            Operation::Integrate => OperatorKind::Integrate,
            Operation::Hcm => OperatorKind::HcmIntegrate,
            Operation::Pca => OperatorKind::PrincipalComponents,
        }
    }
}

/// Background fitting, integration and PCA of spectrum images stored as `.npy`/`.npz`.
///
/// Options that are not given fall back to the saved settings.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Spectrum image: 1D spectrum, 2D line scan (positions, channels) or 3D map (x, y, channels)
    input: PathBuf,

    #[arg(short = 'x', long, value_enum, default_value_t = Operation::Integrate)]
    operation: Operation,

    /// Background model: none, constant, linear, exponential, power or lcpl
    #[arg(short, long)]
    model: Option<FitModel>,

    /// Fit window [START, END) in channels
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    fit: Option<Vec<usize>>,

    /// Integration window [START, END) in channels
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    integration: Option<Vec<usize>>,

    /// PCA window [START, END) in channels
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    pca: Option<Vec<usize>>,

    /// Subtract the per-channel mean before the SVD
    #[arg(long)]
    mean_centering: bool,

    /// Poisson noise weighting of the PCA
    #[arg(long)]
    weighted: bool,

    /// FWHM in pixels of the spatial blur applied before fitting (0 disables it)
    #[arg(long)]
    oversampling: Option<f64>,

    /// Low and high percentile picking the LCPL exponents
    #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"])]
    percentiles: Option<Vec<f64>>,

    /// Rebuild the cube from this many principal components (PCA only)
    #[arg(short = 'k', long)]
    components: Option<usize>,

    /// Channels of a two-point recalibration
    #[arg(long, num_args = 2, value_names = ["C0", "C1"])]
    calibration_channels: Option<Vec<usize>>,

    /// Energies of the two calibration channels
    #[arg(long, num_args = 2, value_names = ["E0", "E1"], allow_hyphen_values = true)]
    energies: Option<Vec<String>>,

    /// One-point recalibration: reference channel, its energy and the channel width
    #[arg(
        long,
        num_args = 3,
        value_names = ["CHANNEL", "ENERGY", "WIDTH"],
        conflicts_with = "energies",
        allow_hyphen_values = true
    )]
    one_point: Option<Vec<String>>,

    /// Energy unit of the recalibrated axis
    #[arg(long)]
    unit: Option<String>,

    /// Directory receiving the `.npy` results
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Store the resulting request as the new default
    #[arg(long)]
    save_settings: bool,
}

fn window(values: &Option<Vec<usize>>, fallback: ChannelWindow) -> ChannelWindow {
    match values.as_deref() {
        Some([start, end]) => ChannelWindow::new(*start, *end),
        _ => fallback,
    }
}

impl Args {
    fn request(&self, defaults: &AnalysisRequest) -> AnalysisRequest {
        let mut request = defaults.clone();
        if let Some(model) = self.model {
            request.model = model;
        }
        request.fit_window = window(&self.fit, request.fit_window);
        request.integration_window = window(&self.integration, request.integration_window);
        request.pca_window = window(&self.pca, request.pca_window);
        request.mean_centering |= self.mean_centering;
        request.weighted_pca |= self.weighted;
        if let Some(fwhm) = self.oversampling {
            request.oversampling_fwhm = fwhm;
        }
        if let Some([low, high]) = self.percentiles.as_deref() {
            request.lcpl_percentiles = [*low, *high];
        }
        if let Some([c0, c1]) = self.calibration_channels.as_deref() {
            request.calibration_channels = [*c0, *c1];
        }
        if let Some(components) = self.components {
            request.components = components;
        }
        request
    }

    fn recalibration(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Option<Recalibration>, CalibrationError> {
        let recalibration = match (self.energies.as_deref(), self.one_point.as_deref()) {
            (Some([e0, e1]), _) => {
                Recalibration::parse_two_point(request.calibration_channels, e0, e1)?
            }
            (_, Some([channel, energy, width])) => {
                let channel = channel.trim().parse::<usize>().map_err(|_| {
                    CalibrationError::NotANumber {
                        field: "reference channel",
                        input: channel.clone(),
                    }
                })?;
                Recalibration::parse_one_point(channel, energy, width)?
            }
            _ => return Ok(None),
        };
        Ok(Some(match &self.unit {
            Some(unit) => recalibration.with_unit(unit),
            None => recalibration,
        }))
    }
}

fn setup_logging(level: &str) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_str(level)?
        .log_to_file(FileSpec::default().directory("logs"))
        .duplicate_to_stderr(Duplicate::Warn)
        .duplicate_to_stdout(Duplicate::Info)
        .rotate(
            flexi_logger::Criterion::Size(1024 * 1024), //1MB
            flexi_logger::Naming::Timestamps,
            flexi_logger::Cleanup::KeepLogFiles(5),
        )
        .start()
}

/// Waits for the next event that ends a command, logging progress meanwhile.
fn wait_for_event(thread_communication: &ThreadCommunication) -> Result<AnalysisEvent, String> {
    loop {
        match thread_communication
            .event_rx
            .recv_timeout(Duration::from_millis(500))
        {
            Ok(AnalysisEvent::Failed(message)) => return Err(message),
            Ok(AnalysisEvent::Cancelled) => return Err("calculation cancelled".to_string()),
            Ok(event) => return Ok(event),
            Err(RecvTimeoutError::Timeout) => {
                if let Ok(progress) = thread_communication.progress_lock.read() {
                    if let Some(p) = *progress {
                        log::info!("{} %", (p * 100.0) as u8);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err("analysis thread stopped unexpectedly".to_string())
            }
        }
    }
}

fn save_latest_output(
    thread_communication: &ThreadCommunication,
    args: &Args,
) -> Result<(), String> {
    let stem = args
        .input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let output_guard = thread_communication
        .output_lock
        .read()
        .map_err(|err| err.to_string())?;
    let Some(output) = output_guard.as_ref() else {
        return Err("no result available".to_string());
    };
    if let AnalysisOutput::HcmIntegrated { non_finite, .. } = output {
        if *non_finite > 0 {
            log::warn!("{non_finite} pixels of the HCM map are not finite");
        }
    }
    save_output(output, &args.output_dir, &stem).map_err(|err| err.to_string())?;
    Ok(())
}

fn run(args: &Args, thread_communication: &ThreadCommunication) -> Result<(), String> {
    let request = args.request(&thread_communication.settings.request);
    let recalibration = args
        .recalibration(&request)
        .map_err(|err| err.to_string())?;

    send_command(
        thread_communication,
        AnalysisCommand::LoadImage(args.input.clone()),
    );
    wait_for_event(thread_communication)?;

    if let Some(recalibration) = recalibration {
        send_command(
            thread_communication,
            AnalysisCommand::Recalibrate(recalibration),
        );
        wait_for_event(thread_communication)?;
    }

    let components = request.components;
    send_command(thread_communication, AnalysisCommand::Configure(request));
    wait_for_event(thread_communication)?;

    let kind = OperatorKind::from(args.operation);
    send_command(thread_communication, AnalysisCommand::Run(kind));
    wait_for_event(thread_communication)?;
    save_latest_output(thread_communication, args)?;

    if kind == OperatorKind::PrincipalComponents && args.components.is_some() {
        send_command(thread_communication, AnalysisCommand::Reconstruct(components));
        wait_for_event(thread_communication)?;
        save_latest_output(thread_communication, args)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut settings = AnalysisSettings::default();
    let load_result = AnalysisSettings::load(&APP_INFO, SETTINGS_KEY);
    let settings_loaded = load_result.is_ok();
    if let Ok(loaded) = load_result {
        settings = loaded;
    }

    let _logger = match setup_logging(&settings.log_level) {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("failed to start logging: {err}");
            None
        }
    };
    log::info!(
        "{} {} ({} on {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("GIT_BRANCH")
    );

    if !settings_loaded || args.save_settings {
        // save default settings
        if args.save_settings {
            settings.request = args.request(&settings.request);
        }
        if let Err(err) = settings.save(&APP_INFO, SETTINGS_KEY) {
            log::error!("error in saving settings: {err:?}");
        }
    }

    let thread_communication = ThreadCommunication::new(settings);
    let worker = {
        let thread_communication = thread_communication.clone();
        thread::spawn(move || main_thread(thread_communication))
    };

    let result = run(&args, &thread_communication);
    send_command(&thread_communication, AnalysisCommand::Quit);
    if worker.join().is_err() {
        log::error!("analysis thread panicked");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            log::error!("{message}");
            ExitCode::FAILURE
        }
    }
}
