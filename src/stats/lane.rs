use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::types::{Result, UmbraError};

/// Unit of background work. Errors are logged by the worker.
pub type LaneTask = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum LaneMessage {
    Run(LaneTask),
    Barrier(SyncSender<()>),
}

/// Single background worker executing tasks strictly one at a time, in submission order.
pub struct CorrectionLane {
    sender: Mutex<Option<SyncSender<LaneMessage>>>,
    done: Mutex<Option<Receiver<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CorrectionLane {
    /// Spawns the worker thread. At most `capacity` messages wait in the queue; further
    /// submissions block until the worker catches up.
    pub fn spawn(name: &str, capacity: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<LaneMessage>(capacity.max(1));
        let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                Self::run(receiver);
                let _ = done_tx.send(());
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            done: Mutex::new(Some(done_rx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run(receiver: Receiver<LaneMessage>) {
        for message in receiver {
            match message {
                LaneMessage::Run(task) => {
                    if let Err(err) = task() {
                        if err.is_benign_close() {
                            debug!(error = %err, "stats.lane.task_closed");
                        } else {
                            warn!(error = %err, "stats.lane.task_failed");
                        }
                    }
                }
                LaneMessage::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        trace!("stats.lane.drained");
    }

    /// Queues `task` behind everything already submitted.
    pub fn submit(&self, task: LaneTask) -> Result<()> {
        self.send(LaneMessage::Run(task))
    }

    /// Waits until every task submitted before this call has finished. Returns `false`
    /// if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.send(LaneMessage::Barrier(ack_tx))?;
        match ack_rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(UmbraError::ResourceClosed("correction lane"))
            }
        }
    }

    fn send(&self, message: LaneMessage) -> Result<()> {
        // Clone the sender so a full queue does not block shutdown.
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(UmbraError::ResourceClosed("correction lane"))?;
        sender
            .send(message)
            .map_err(|_| UmbraError::ResourceClosed("correction lane"))
    }

    /// Stops accepting tasks and waits up to `timeout` for the queue to drain.
    ///
    /// Calling it again after a successful shutdown is a no-op.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.sender.lock().take();
        let Some(done) = self.done.lock().take() else {
            return Ok(());
        };
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.lock().take() {
                    if worker.join().is_err() {
                        warn!("stats.lane.worker_panicked");
                    }
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                // Put the signal back so a later call can keep waiting.
                *self.done.lock() = Some(done);
                Err(UmbraError::CorrectorShutdownTimeout(timeout))
            }
        }
    }

    /// Whether [`CorrectionLane::shutdown`] has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl std::fmt::Debug for CorrectionLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectionLane")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
