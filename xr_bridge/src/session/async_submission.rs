/// Background compositor submission
///
/// One worker thread owns the compositor's frame calls. Per frame it waits for
/// the compositor, begins the frame, reports itself idle, then blocks until
/// the render thread hands it a layer set (bounded queue of one) or the
/// session cancels it.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tokio_util::sync::CancellationToken;

use crate::compositor::{CompositorLayer, CompositorSdk};
use crate::error::{Error, Result};

/// How often a blocked worker re-checks cancellation
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Layers for one frame
#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub frame_id: u64,
    pub layers: Vec<CompositorLayer>,
}

/// Sent by the worker once it has begun a frame and waits for layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdle {
    pub frame_id: u64,
}

#[derive(Default)]
struct WorkerShared {
    last_begin: Option<Instant>,
    error: Option<Error>,
}

pub struct AsyncSubmission {
    jobs: Sender<SubmissionJob>,
    idle: Receiver<WorkerIdle>,
    /// Idle notification already consumed by the render thread
    ticket: Option<WorkerIdle>,
    token: CancellationToken,
    shared: Arc<Mutex<WorkerShared>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncSubmission {
    pub fn start(compositor: Arc<dyn CompositorSdk>, first_frame: u64) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<SubmissionJob>(1);
        let (idle_tx, idle_rx) = bounded::<WorkerIdle>(1);
        let token = CancellationToken::new();
        let shared = Arc::new(Mutex::new(WorkerShared::default()));

        let worker_token = token.clone();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("xr_bridge-submission".to_string())
            .spawn(move || {
                worker_loop(compositor, first_frame, job_rx, idle_tx, worker_token, worker_shared)
            })
            .map_err(|e| Error::RuntimeFailure(format!("Failed to spawn submission worker: {}", e)))?;

        crate::bridge_info!("xr_bridge::AsyncSubmission", "Submission worker started at frame {}", first_frame);
        Ok(Self {
            jobs: job_tx,
            idle: idle_rx,
            ticket: None,
            token,
            shared,
            handle: Some(handle),
        })
    }

    /// Wait for the worker to be idle, at most until `deadline` (forever when `None`)
    ///
    /// Returns whether the worker is idle.
    pub fn wait_idle(&mut self, deadline: Option<Instant>) -> Result<bool> {
        if self.ticket.is_some() {
            return Ok(true);
        }
        let received = match deadline {
            Some(deadline) => match self.idle.recv_deadline(deadline) {
                Ok(ticket) => Some(ticket),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.worker_gone());
                }
            },
            None => Some(self.idle.recv().map_err(|_| self.worker_gone())?),
        };
        self.ticket = received;
        Ok(self.ticket.is_some())
    }

    /// Hand a frame to the idle worker; waits for idleness first
    pub fn submit(&mut self, job: SubmissionJob) -> Result<()> {
        if let Some(error) = self.take_error() {
            return Err(error);
        }
        self.wait_idle(None)?;
        self.ticket = None;
        self.jobs.send(job).map_err(|_| self.worker_gone())
    }

    /// When the worker last began a compositor frame
    pub fn last_begin(&self) -> Option<Instant> {
        self.shared.lock().ok().and_then(|s| s.last_begin)
    }

    /// Failure reported by the worker since the last call
    pub fn take_error(&self) -> Option<Error> {
        self.shared.lock().ok().and_then(|mut s| s.error.take())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel and join the worker
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                crate::bridge_error!("xr_bridge::AsyncSubmission", "Submission worker panicked");
            }
            crate::bridge_info!("xr_bridge::AsyncSubmission", "Submission worker stopped");
        }
    }

    fn worker_gone(&self) -> Error {
        self.take_error()
            .unwrap_or_else(|| Error::RuntimeFailure("Submission worker exited".to_string()))
    }
}

impl Drop for AsyncSubmission {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_error(shared: &Mutex<WorkerShared>, error: Error) {
    crate::bridge_error!("xr_bridge::AsyncSubmission", "Compositor call failed: {}", error);
    if let Ok(mut shared) = shared.lock() {
        shared.error = Some(error);
    }
}

fn worker_loop(
    compositor: Arc<dyn CompositorSdk>,
    first_frame: u64,
    jobs: Receiver<SubmissionJob>,
    idle: Sender<WorkerIdle>,
    token: CancellationToken,
    shared: Arc<Mutex<WorkerShared>>,
) {
    let mut frame_id = first_frame;

    while !token.is_cancelled() {
        if let Err(e) = compositor.wait_to_begin_frame(frame_id) {
            record_error(&shared, e);
            break;
        }
        if let Err(e) = compositor.begin_frame(frame_id) {
            record_error(&shared, e);
            break;
        }
        if let Ok(mut shared) = shared.lock() {
            shared.last_begin = Some(Instant::now());
        }
        if idle.send(WorkerIdle { frame_id }).is_err() {
            break;
        }

        let job = loop {
            match jobs.recv_timeout(CANCEL_POLL) {
                Ok(job) => break Some(job),
                Err(RecvTimeoutError::Timeout) => {
                    if token.is_cancelled() {
                        break None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break None,
            }
        };
        let Some(job) = job else { break };

        if let Err(e) = compositor.submit_frame(job.frame_id, &job.layers) {
            record_error(&shared, e);
        }
        frame_id = job.frame_id + 1;
    }

    crate::bridge_debug!("xr_bridge::AsyncSubmission", "Worker exiting after frame {}", frame_id);
}

#[cfg(test)]
#[path = "async_submission_tests.rs"]
mod tests;
