//! Component wiring and lifecycle.
//!
//! The [`Supervisor`] owns every core component, wires the observer
//! chains between them and spawns the background tasks: the port pump,
//! the queue dispatch loop, the SD watcher tick and the three value
//! updater workers. Teardown walks the same graph in reverse dependency
//! order and joins everything within `EXIT_TIMEOUT`.
//!
//! Ownership: the supervisor owns the state manager, which owns its
//! signals; components hold handles only for as long as they are
//! attached, and `shutdown` detaches them.

use std::io;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use printer_protocol::{State, EXIT_TIMEOUT};

use crate::commands::{CommandContext, CommandOptions, FilePrinter, LocalStorage, Telemetry};
use crate::config::Settings;
use crate::job::Job;
use crate::sd::SdCardWatch;
use crate::serial::link::{open_serial, serial_dtr, serial_pump, DtrResetShim, PortCommand};
use crate::serial::matcher::{LineMatcher, MatchToken};
use crate::serial::queue::SerialQueue;
use crate::signal::Signal;
use crate::state::{StateManager, StateOptions};
use crate::stats::PrintStats;
use crate::values::ItemUpdater;

/// External collaborators a command context needs; owned by the caller,
/// injected here.
pub struct Collaborators {
    pub file_printer: Arc<dyn FilePrinter>,
    pub storage: Arc<dyn LocalStorage>,
    pub telemetry: Arc<dyn Telemetry>,
}

/// Owns the core components and their background tasks.
pub struct Supervisor {
    pub matcher: Arc<LineMatcher>,
    pub queue: Arc<SerialQueue>,
    pub state: Arc<StateManager>,
    pub updater: Arc<ItemUpdater>,
    pub sd: Arc<SdCardWatch>,
    pub job: Arc<Job>,
    pub stats: Arc<PrintStats>,
    port_tx: mpsc::Sender<PortCommand>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    queue_tokens: Vec<MatchToken>,
    command_options: CommandOptions,
}

impl Supervisor {
    /// Opens the configured serial port and starts everything.
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        settings
            .validate()
            .context("adapter configuration rejected")?;
        let stream = open_serial(&settings.serial.port, settings.serial.baud)?;
        Ok(Self::start(stream, serial_dtr(), settings))
    }

    /// Starts the adapter over an already open stream.
    ///
    /// Generic over the stream so tests drive the whole stack through an
    /// in-memory duplex.
    pub fn start<S, D>(stream: S, set_dtr: D, settings: &Settings) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        D: FnMut(&mut S, bool) -> io::Result<()> + Send + 'static,
    {
        let (port_tx, port_rx) = mpsc::channel::<PortCommand>(64);
        let (running_tx, running_rx) = watch::channel(true);

        let matcher = Arc::new(LineMatcher::new());
        let queue = SerialQueue::new(port_tx.clone(), running_rx.clone());
        let queue_tokens = queue.attach(&matcher);

        let state = StateManager::new(StateOptions {
            m0_after_prints: settings.printer.m0_after_prints,
        });
        state.register_handlers(&matcher);

        let sd = SdCardWatch::new(
            Arc::clone(&queue),
            Arc::clone(&state),
            Some(settings.printer.sd_mount_name.clone()),
            running_rx.clone(),
        );
        sd.register_handlers(&matcher);

        let updater = ItemUpdater::new();
        updater.start();

        let stats = Arc::new(PrintStats::new());

        // Observer chains between the components.
        {
            let weak = Arc::downgrade(&state);
            queue.confirmed_signal().connect(move |_| {
                if let Some(state) = weak.upgrade() {
                    state.instruction_confirmed();
                }
            });
        }
        {
            // Print-time segments follow the reported state, so pauses
            // observed on the serial line stop the clock too.
            let stats = Arc::clone(&stats);
            state.state_changed_signal().connect(move |event| match event.to {
                State::Printing => stats.start_time_segment(),
                State::Paused => stats.end_time_segment(),
                _ => {}
            });
        }
        {
            let weak = Arc::downgrade(&state);
            queue.fatal_signal().connect(move |event| {
                error!(requested = event.requested, "serial session lost");
                if let Some(state) = weak.upgrade() {
                    state.serial_error();
                }
            });
        }
        queue.stall_signal().connect(|event| {
            warn!(gcode = %event.gcode, sequence = ?event.sequence, "serial queue stalled");
        });

        let mut tasks = Vec::new();

        let pump_matcher = Arc::clone(&matcher);
        let pump_running = running_rx.clone();
        let pump_state = Arc::downgrade(&state);
        tasks.push((
            "serial-pump",
            tokio::spawn(async move {
                let on_line = move |line: &str| pump_matcher.feed(line);
                if let Err(err) = serial_pump(stream, port_rx, on_line, set_dtr, pump_running).await
                {
                    error!(%err, "serial pump failed");
                    if let Some(state) = pump_state.upgrade() {
                        state.serial_error();
                    }
                }
            }),
        ));

        tasks.push(("serial-queue", tokio::spawn(Arc::clone(&queue).run())));
        tasks.push(("sd-watcher", tokio::spawn(Arc::clone(&sd).run())));

        info!("adapter core started");
        Self {
            matcher,
            queue,
            state,
            updater,
            sd,
            job: Job::new(),
            stats,
            port_tx,
            running_tx,
            running_rx,
            tasks: Mutex::new(tasks),
            queue_tokens,
            command_options: CommandOptions {
                reset_pin: settings.printer.reset_pin,
                sd_mount_name: settings.printer.sd_mount_name.clone(),
            },
        }
    }

    /// Builds a command context around this core and the given external
    /// collaborators.
    pub fn command_context(&self, collaborators: Collaborators) -> CommandContext {
        CommandContext {
            queue: Arc::clone(&self.queue),
            state: Arc::clone(&self.state),
            matcher: Arc::clone(&self.matcher),
            sd: Arc::clone(&self.sd),
            job: Arc::clone(&self.job),
            stats: Arc::clone(&self.stats),
            file_printer: collaborators.file_printer,
            storage: collaborators.storage,
            telemetry: collaborators.telemetry,
            reset: Arc::new(DtrResetShim::new(self.port_tx.clone())),
            running: self.running_rx.clone(),
            options: self.command_options.clone(),
        }
    }

    /// Subscribe to the reported-state changes.
    pub fn state_changed_signal(&self) -> &Signal<crate::state::StateChangedEvent> {
        self.state.state_changed_signal()
    }

    /// Tears everything down in reverse dependency order and joins the
    /// background tasks within `EXIT_TIMEOUT`.
    pub async fn shutdown(&self) {
        info!("adapter core shutting down");

        // Stop the producers first, then the plumbing underneath them.
        self.updater.stop().await;
        self.queue.stop();
        let _ = self.running_tx.send(false);

        self.state.detach(&self.matcher);
        self.sd.detach(&self.matcher);
        for token in &self.queue_tokens {
            if let Err(err) = self.matcher.remove_handler(token) {
                warn!(%err, "queue handler already removed");
            }
        }

        let tasks: Vec<(&'static str, JoinHandle<()>)> = self
            .tasks
            .lock()
            .expect("supervisor task list poisoned")
            .drain(..)
            .collect();
        let deadline = tokio::time::Instant::now() + EXIT_TIMEOUT;
        for (name, task) in tasks {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(task = name, %err, "background task panicked"),
                Err(_) => {
                    warn!(task = name, "background task did not stop in time, aborting");
                }
            }
        }
        info!("adapter core stopped");
    }
}
