//! Blocking bridge onto a dedicated async worker thread.
//!
//! A [`Dispatcher`] owns one OS thread running a current-thread tokio
//! runtime. Work arrives on two ordered lanes: the command lane for
//! caller-initiated operations and the event lane for transport-delivered
//! packets. Both lanes are drained concurrently by the same runtime, but each
//! lane runs its units strictly one after another in arrival order.
//!
//! Callers on any thread submit a closure and receive a [`Pending`] handle
//! they can block on with an optional deadline. Errors and panics raised by a
//! unit are returned through the handle.
//!
//! ```ignore
//! let dispatcher = Dispatcher::new("engine", Arc::new(State::default()));
//! dispatcher.start()?;
//! let answer = dispatcher
//!     .submit_command(|state| async move { state.compute().await })
//!     .wait(Some(Duration::from_secs(1)))?;
//! dispatcher.stop()?;
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A unit of work bound for one lane.
enum Unit<S> {
    Work { epoch: u64, task: Box<dyn Task<S>> },
    Stop(std_mpsc::SyncSender<()>),
}

/// Type-erased unit of work with its completion slot.
trait Task<S>: Send {
    fn run(self: Box<Self>, state: Arc<S>) -> BoxFuture<'static, ()>;
    fn cancel(self: Box<Self>, error: Error);
}

struct OpTask<F, T> {
    op: F,
    done: std_mpsc::SyncSender<Result<T>>,
}

impl<S, F, Fut, T> Task<S> for OpTask<F, T>
where
    S: Send + Sync + 'static,
    F: FnOnce(Arc<S>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, state: Arc<S>) -> BoxFuture<'static, ()> {
        let OpTask { op, done } = *self;
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(move || op(state))) {
            Ok(fut) => fut,
            Err(panic) => {
                let _ = done.send(Err(Error::TaskPanicked(panic_message(panic.as_ref()))));
                return Box::pin(async {});
            }
        };
        Box::pin(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(Error::TaskPanicked(panic_message(panic.as_ref()))),
            };
            // The caller may have given up waiting.
            let _ = done.send(result);
        })
    }

    fn cancel(self: Box<Self>, error: Error) {
        let _ = self.done.send(Err(error));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Completion handle for a submitted unit of work.
#[must_use = "a pending result does nothing unless waited on"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: std_mpsc::Receiver<Result<T>>,
    operation: String,
}

impl<T> Pending<T> {
    fn new(rx: std_mpsc::Receiver<Result<T>>) -> Self {
        Self {
            rx,
            operation: "queued operation".to_string(),
        }
    }

    fn failed(error: Error) -> Self {
        let (tx, rx) = std_mpsc::sync_channel(1);
        let _ = tx.send(Err(error));
        Self::new(rx)
    }

    /// Name the operation in the timeout error returned by [`Pending::wait`].
    pub fn named(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Block until the unit completes.
    ///
    /// With `Some(timeout)` this fails with [`Error::Timeout`] once the
    /// deadline passes; the unit itself keeps running on the worker.
    pub fn wait(self, timeout: Option<Duration>) -> Result<T> {
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(Error::timeout(self.operation, timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(Error::EngineStopped),
            },
            None => self.rx.recv().unwrap_or(Err(Error::EngineStopped)),
        }
    }
}

struct Lanes<S> {
    command: mpsc::UnboundedSender<Unit<S>>,
    event: mpsc::UnboundedSender<Unit<S>>,
    thread: JoinHandle<()>,
}

impl<S> Lanes<S> {
    fn signal_stop(self) {
        let (command_ack, _) = std_mpsc::sync_channel(1);
        let (event_ack, _) = std_mpsc::sync_channel(1);
        let _ = self.command.send(Unit::Stop(command_ack));
        let _ = self.event.send(Unit::Stop(event_ack));
    }
}

/// Dedicated worker thread draining a command lane and an event lane.
pub struct Dispatcher<S> {
    name: String,
    state: Arc<S>,
    epoch: Arc<AtomicU64>,
    lanes: Mutex<Option<Lanes<S>>>,
}

impl<S: Send + Sync + 'static> Dispatcher<S> {
    /// Create a stopped dispatcher around `state`.
    pub fn new(name: impl Into<String>, state: Arc<S>) -> Self {
        Self {
            name: name.into(),
            state,
            epoch: Arc::new(AtomicU64::new(0)),
            lanes: Mutex::new(None),
        }
    }

    /// Shared state handed to every unit of work.
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Whether the worker thread is accepting work.
    pub fn is_running(&self) -> bool {
        self.lock_lanes().is_some()
    }

    /// Spawn the worker thread, blocking until its runtime is ready.
    ///
    /// Starting an already running dispatcher is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut lanes = self.lock_lanes();
        if lanes.is_some() {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::io::Result<()>>(1);
        let state = Arc::clone(&self.state);
        let epoch = Arc::clone(&self.epoch);
        let name = self.name.clone();

        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(async {
                    futures::join!(
                        drain("command", command_rx, Arc::clone(&state), Arc::clone(&epoch)),
                        drain("event", event_rx, state, epoch),
                    );
                });
                debug!(dispatcher = %name, "Worker thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(Error::Io(e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::EngineStopped);
            }
        }

        debug!(dispatcher = %self.name, "Worker thread ready");
        *lanes = Some(Lanes {
            command: command_tx,
            event: event_tx,
            thread,
        });
        Ok(())
    }

    /// Queue `op` on the command lane.
    pub fn submit_command<T, F, Fut>(&self, op: F) -> Pending<T>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Lane::Command, op)
    }

    /// Queue `op` on the event lane.
    pub fn submit_event<T, F, Fut>(&self, op: F) -> Pending<T>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(Lane::Event, op)
    }

    fn submit<T, F, Fut>(&self, lane: Lane, op: F) -> Pending<T>
    where
        F: FnOnce(Arc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done, rx) = std_mpsc::sync_channel(1);
        let unit = Unit::Work {
            epoch: self.epoch.load(Ordering::Acquire),
            task: Box::new(OpTask { op, done }),
        };

        let lanes = self.lock_lanes();
        let Some(lanes) = lanes.as_ref() else {
            return Pending::failed(Error::EngineStopped);
        };
        let sender = match lane {
            Lane::Command => &lanes.command,
            Lane::Event => &lanes.event,
        };
        if let Err(mpsc::error::SendError(unit)) = sender.send(unit) {
            if let Unit::Work { task, .. } = unit {
                task.cancel(Error::EngineStopped);
            }
        }
        Pending::new(rx)
    }

    /// Cancel every unit queued so far.
    ///
    /// Units submitted before this call complete with [`Error::Cancelled`]
    /// when they reach the front of their lane instead of running. A unit
    /// that is already running is unaffected.
    pub fn cancel_queued(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(dispatcher = %self.name, epoch, "Cancelling queued work");
    }

    /// Drain both lanes and join the worker thread.
    ///
    /// Units queued before the stop run to completion first. Stopping a
    /// dispatcher that is not running is a no-op.
    pub fn stop(&self) -> Result<()> {
        let Some(lanes) = self.lock_lanes().take() else {
            return Ok(());
        };

        let (command_ack, command_rx) = std_mpsc::sync_channel(1);
        let (event_ack, event_rx) = std_mpsc::sync_channel(1);
        let _ = lanes.command.send(Unit::Stop(command_ack));
        let _ = lanes.event.send(Unit::Stop(event_ack));
        // A lane whose receiver is gone has already stopped.
        let _ = command_rx.recv();
        let _ = event_rx.recv();

        if lanes.thread.join().is_err() {
            warn!(dispatcher = %self.name, "Worker thread panicked during shutdown");
            return Err(Error::TaskPanicked(format!("{} worker thread", self.name)));
        }
        debug!(dispatcher = %self.name, "Stopped");
        Ok(())
    }

    /// Signal both lanes to stop without joining the worker thread.
    ///
    /// For a worker whose running unit may never finish: the thread exits on
    /// its own once that unit returns. Queued units are cancelled.
    pub fn detach(&self) {
        let Some(lanes) = self.lock_lanes().take() else {
            return;
        };
        self.cancel_queued();
        lanes.signal_stop();
        debug!(dispatcher = %self.name, "Detached from worker thread");
    }

    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, Option<Lanes<S>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        let lanes = self
            .lanes
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lanes) = lanes {
            // Joining here could deadlock when dropped from a unit of work.
            lanes.signal_stop();
        }
    }
}

#[derive(Clone, Copy)]
enum Lane {
    Command,
    Event,
}

async fn drain<S: Send + Sync + 'static>(
    lane: &'static str,
    mut rx: mpsc::UnboundedReceiver<Unit<S>>,
    state: Arc<S>,
    epoch: Arc<AtomicU64>,
) {
    while let Some(unit) = rx.recv().await {
        match unit {
            Unit::Stop(ack) => {
                let _ = ack.send(());
                debug!(lane, "Lane stopped");
                return;
            }
            Unit::Work { epoch: submitted, task } => {
                if submitted < epoch.load(Ordering::Acquire) {
                    task.cancel(Error::Cancelled);
                    continue;
                }
                task.run(Arc::clone(&state)).await;
            }
        }
    }
}
