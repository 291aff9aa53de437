use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nfw_common::{ErrorReporter, TracingReporter};
use nfw_transport::{QueueBackend, QueueSession};

use crate::{
    worker::{Binding, Bindings, Worker},
    FirewallConfig, QueueError,
};

/// Lifecycle state of a [`Firewall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    /// A start is setting up the session and queues.
    Starting,
    Running,
    /// The worker left its loop (stop requested or session failed), join pending.
    Stopping,
}

/// Owns the queue session, the configured queues and the worker that answers their packets.
///
/// Start and stop are synchronous: [`Firewall::start`] returns once the worker runs, and
/// [`Firewall::stop`] returns once it has torn everything down. The firewall is stopped on drop.
pub struct Firewall<B: QueueBackend> {
    backend: B,
    config: FirewallConfig,
    reporter: Arc<dyn ErrorReporter>,
    running: Arc<AtomicBool>,
    starting: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Clears a flag when dropped.
struct Clear<'a>(&'a AtomicBool);

impl Drop for Clear<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: QueueBackend + fmt::Debug> fmt::Debug for Firewall<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firewall")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<B: QueueBackend> Firewall<B> {
    /// Creates a stopped firewall that reports errors through `tracing`.
    pub fn new(backend: B, config: FirewallConfig) -> Self {
        Self {
            backend,
            config,
            reporter: Arc::new(TracingReporter),
            running: Arc::new(AtomicBool::new(false)),
            starting: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Replaces the error channel.
    pub fn with_reporter(mut self, reporter: impl ErrorReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    /// The current state. Never waits for a concurrent start or stop.
    pub fn state(&self) -> State {
        if self.starting.load(Ordering::Acquire) {
            return State::Starting;
        }

        // Held by a stop joining the worker, or by a start about to return.
        let Some(worker) = self.worker.try_lock() else {
            return if self.running.load(Ordering::Acquire) { State::Running } else { State::Stopping };
        };

        match worker.as_ref() {
            None => State::Stopped,
            Some(handle) if self.running.load(Ordering::Acquire) && !handle.is_finished() => {
                State::Running
            }
            Some(_) => State::Stopping,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Opens a session, creates the configured queues and spawns the worker.
    ///
    /// Failing to create a queue, or to apply its fail-open or length option, is reported and
    /// the remaining queues are still set up. Failing to open the session, bind the protocol
    /// family, set a queue's copy mode or spawn the worker is fatal: whatever was set up is torn
    /// down and the firewall stays stopped. Every returned error has already been reported.
    pub fn start(&self) -> Result<(), QueueError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.fail(QueueError::AlreadyRunning));
        }
        // Declared before the lock so the flag is cleared after the lock is released.
        let _starting = Clear(&self.starting);
        let mut worker = self.worker.lock();

        if self.running.load(Ordering::Acquire) {
            return Err(self.fail(QueueError::AlreadyRunning));
        }

        // The previous worker exited on its own.
        if let Some(handle) = worker.take() {
            self.join(handle);
        }

        let session = self.backend.open().map_err(|source| self.fail(QueueError::Open(source)))?;
        let mut bindings = Bindings::new(session);

        let family = self.config.protocol_family;
        if let Err(source) = bindings.session().bind_family(family) {
            let err = self.fail(QueueError::BindFamily { family, source });
            bindings.teardown(&*self.reporter);
            return Err(err);
        }
        debug!(%family, "bound protocol family");

        if let Err(err) = self.create_queues(&mut bindings) {
            bindings.teardown(&*self.reporter);
            return Err(err);
        }

        let queues = bindings.len();
        let task = Worker::new(
            bindings,
            Arc::clone(&self.running),
            Arc::clone(&self.reporter),
            self.config.poll_timeout,
            self.config.recv_buffer_size,
        );

        // Hand the worker over through a slot, so it can be torn down here if spawning fails.
        let slot = Arc::new(Mutex::new(Some(task)));
        let handoff = Arc::clone(&slot);

        self.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new().name("nfw-queue".to_owned()).spawn(move || {
            let task = handoff.lock().take();
            if let Some(task) = task {
                task.run();
            }
        });

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(queues, "firewall started");
                Ok(())
            }
            Err(source) => {
                self.running.store(false, Ordering::Release);
                let err = self.fail(QueueError::Spawn(source));
                let task = slot.lock().take();
                if let Some(task) = task {
                    task.teardown();
                }
                Err(err)
            }
        }
    }

    fn create_queues(&self, bindings: &mut Bindings<B::Session>) -> Result<(), QueueError> {
        for registration in &self.config.queues {
            let queue = registration.number();

            if bindings.contains(queue) {
                let source = io::Error::new(io::ErrorKind::AlreadyExists, "registered twice");
                self.fail(QueueError::CreateQueue { queue, source });
                continue;
            }

            let session = bindings.session();
            let handle = match session.create_queue(queue) {
                Ok(handle) => handle,
                Err(source) => {
                    self.fail(QueueError::CreateQueue { queue, source });
                    continue;
                }
            };

            let mode = registration.copy_mode();
            let range = registration.copy_range();
            let moded = session.set_mode(&handle, mode, range);

            if let Some(enabled) = registration.fail_open_flag().filter(|_| moded.is_ok()) {
                if let Err(source) = session.set_fail_open(&handle, enabled) {
                    self.fail(QueueError::SetFlags { queue, source });
                }
            }

            if let Some(len) = registration.max_queue_len().filter(|_| moded.is_ok()) {
                if let Err(source) = session.set_max_len(&handle, len) {
                    self.fail(QueueError::SetMaxLen { queue, source });
                }
            }

            // Inserted before bailing out so the queue is destroyed with the rest.
            bindings.insert(Binding::new(handle, Arc::clone(registration.handler())));

            if let Err(source) = moded {
                return Err(self.fail(QueueError::SetMode { queue, source }));
            }

            debug!(queue, ?mode, range, "created queue");
        }

        Ok(())
    }

    /// Stops the worker and waits until it has destroyed the queues and closed the session.
    /// The worker notices within one poll timeout. Does nothing when stopped.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        self.running.store(false, Ordering::Release);

        if let Some(handle) = worker.take() {
            self.join(handle);
            info!("firewall stopped");
        }
    }

    fn join(&self, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            warn!("queue worker panicked");
            self.fail(QueueError::WorkerPanicked);
        }
    }

    fn fail(&self, err: QueueError) -> QueueError {
        err.report_to(&*self.reporter);
        err
    }
}

impl<B: QueueBackend> Drop for Firewall<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
