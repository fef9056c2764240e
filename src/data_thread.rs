use crate::config::{send_event, AnalysisCommand, AnalysisEvent, ThreadCommunication};
use crate::error::AnalysisError;
use crate::io::open_cube;
use crate::operators::operator::{AnalysisOutput, OperatorKind, ProgressSink};
use crate::session::AnalysisSession;
use std::sync::atomic::Ordering;
use std::time::Instant;

fn publish_output(thread_communication: &ThreadCommunication, output: &AnalysisOutput) {
    if let Ok(mut write_guard) = thread_communication.output_lock.write() {
        *write_guard = Some(output.clone());
    }
}

fn clear_output(thread_communication: &ThreadCommunication) {
    if let Ok(mut write_guard) = thread_communication.output_lock.write() {
        *write_guard = None;
    }
}

/// Reports the outcome of a computation and publishes its result.
fn finish(
    thread_communication: &ThreadCommunication,
    kind: Option<OperatorKind>,
    result: Result<&AnalysisOutput, AnalysisError>,
) {
    thread_communication.progress_lock.report_progress(None);
    match result {
        Ok(output) => {
            publish_output(thread_communication, output);
            send_event(thread_communication, AnalysisEvent::Finished(kind));
        }
        Err(AnalysisError::Cancelled) => {
            log::info!("calculation cancelled");
            send_event(thread_communication, AnalysisEvent::Cancelled);
        }
        Err(err) => {
            log::error!("{err}");
            send_event(thread_communication, AnalysisEvent::Failed(err.to_string()));
        }
    }
}

/// Processes commands until `Quit` is received or every sender is dropped.
pub fn main_thread(thread_communication: ThreadCommunication) {
    let mut session = AnalysisSession::new(thread_communication.settings.calibration.clone());

    while let Ok(command) = thread_communication.command_rx.recv() {
        match command {
            AnalysisCommand::LoadImage(path) => match open_cube(&path) {
                Ok(image) => {
                    let shape = [image.width(), image.height(), image.channel_count()];
                    session.load(image);
                    clear_output(&thread_communication);
                    send_event(&thread_communication, AnalysisEvent::Loaded(shape));
                }
                Err(err) => {
                    log::error!("failed opening {path:?}: {err}");
                    send_event(&thread_communication, AnalysisEvent::Failed(err.to_string()));
                }
            },
            AnalysisCommand::Configure(request) => match session.configure(request) {
                Ok(()) => {
                    log::debug!("{:?} after request {:?}", session.state(), session.request());
                    if session.output().is_none() {
                        clear_output(&thread_communication);
                    }
                    send_event(&thread_communication, AnalysisEvent::Configured);
                }
                Err(err) => {
                    log::error!("rejected request: {err}");
                    send_event(&thread_communication, AnalysisEvent::Failed(err.to_string()));
                }
            },
            AnalysisCommand::Recalibrate(recalibration) => {
                match session.recalibrate(&recalibration) {
                    Ok(()) => {
                        log::info!("recalibrated to {:?}", session.calibration());
                        clear_output(&thread_communication);
                        send_event(&thread_communication, AnalysisEvent::Configured);
                    }
                    Err(err) => {
                        log::error!("rejected recalibration: {err}");
                        send_event(&thread_communication, AnalysisEvent::Failed(err.to_string()));
                    }
                }
            }
            AnalysisCommand::Run(kind) => {
                thread_communication.abort_flag.store(false, Ordering::Relaxed);
                let start = Instant::now();
                let result = session.run(
                    kind,
                    thread_communication.progress_lock.as_ref(),
                    &thread_communication.abort_flag,
                );
                if result.is_ok() {
                    if let Ok(mut times) = thread_communication.computation_time_lock.write() {
                        times.insert(kind, start.elapsed());
                    }
                }
                finish(&thread_communication, Some(kind), result);
                if let Some(pca) = session.pca() {
                    log::debug!(
                        "reconstruction possible from up to {} components",
                        pca.component_count()
                    );
                }
            }
            AnalysisCommand::Reconstruct(components) => {
                let result = session.reconstruct(components);
                finish(&thread_communication, None, result);
            }
            AnalysisCommand::Quit => {
                log::info!("analysis thread stopped");
                break;
            }
        }
    }
}
