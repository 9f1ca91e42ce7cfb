//! # Command Engine
//!
//! High-level operations on top of the serial queue: start, pause,
//! resume and stop a print, execute raw G-code, load and unload
//! filament, reset the printer and report the current job.
//!
//! Commands are data — a [`Command`] variant inside a [`CommandRequest`]
//! carrying the originating command id and source — and share a small
//! executor toolkit instead of a class hierarchy: `try_until_state` for
//! the pause / resume / stop family and `wait_while_running` for every
//! instruction wait. Before any state-affecting dispatch a command
//! registers its intent with the state manager so the observed
//! transition is attributed back to it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use printer_protocol::{
    Source, State, GROUNDED_RESET_PIN, OPEN_RESULT_REGEX, PRINTER_BOOT_REGEX, PRINTER_BOOT_WAIT,
    QUIT_INTERVAL, REJECTION_REGEX, SERIAL_QUEUE_TIMEOUT, STATE_CHANGE_TIMEOUT,
};

use crate::job::{Job, JobState};
use crate::sd::SdCardWatch;
use crate::serial::instruction::Instruction;
use crate::serial::link::ResetShim;
use crate::serial::matcher::LineMatcher;
use crate::serial::queue::SerialQueue;
use crate::state::{StateChange, StateManager};
use crate::stats::PrintStats;

/// Reset must outlast both the boot banner wait and a full queue stall.
const RESET_TIMEOUT: Duration = Duration::from_secs(30);
const _: () = assert!(
    RESET_TIMEOUT.as_millis() >= PRINTER_BOOT_WAIT.as_millis()
        && RESET_TIMEOUT.as_millis() >= SERIAL_QUEUE_TIMEOUT.as_millis()
);

/// Extrusion happens at 90 % of the full nozzle target.
const EXTRUDE_TEMP_RATIO: f64 = 0.9;

/// How a command fails.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The current state forbids the command.
    #[error("refused: {0}")]
    Refused(String),
    /// An expected confirmation or transition never arrived.
    #[error("timed out: {0}")]
    TimedOut(String),
    /// Anything else that stops the command.
    #[error("{0}")]
    Failed(String),
}

/// Print source collaborator for files on local storage.
#[async_trait]
pub trait FilePrinter: Send + Sync {
    fn is_printing(&self) -> bool;
    /// How many commands of the current file have been sent so far;
    /// None when nothing is being printed from a file.
    fn gcode_number(&self) -> Option<u64>;
    async fn start(&self, os_path: &std::path::Path) -> anyhow::Result<()>;
    async fn pause(&self);
    async fn stop(&self);
}

/// Resolves virtual storage paths to filesystem paths.
pub trait LocalStorage: Send + Sync {
    fn os_path(&self, virtual_path: &str) -> Option<PathBuf>;
}

/// Read access to the latest telemetry the observers gathered.
pub trait Telemetry: Send + Sync {
    fn nozzle_temperature(&self) -> Option<f64>;
}

/// Behavior switches mirrored from the adapter configuration.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub reset_pin: u8,
    pub sd_mount_name: String,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            reset_pin: printer_protocol::DEFAULT_RESET_PIN,
            sd_mount_name: printer_protocol::SD_MOUNT_NAME.to_string(),
        }
    }
}

/// Everything a command needs, injected once at wiring time.
pub struct CommandContext {
    pub queue: Arc<SerialQueue>,
    pub state: Arc<StateManager>,
    pub matcher: Arc<LineMatcher>,
    pub sd: Arc<SdCardWatch>,
    pub job: Arc<Job>,
    pub stats: Arc<PrintStats>,
    pub file_printer: Arc<dyn FilePrinter>,
    pub storage: Arc<dyn LocalStorage>,
    pub telemetry: Arc<dyn Telemetry>,
    pub reset: Arc<dyn ResetShim>,
    pub running: watch::Receiver<bool>,
    pub options: CommandOptions,
}

/// Preheat targets for the filament commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilamentParams {
    pub bed_temperature: u32,
    pub nozzle_temperature: u32,
}

/// The defined operations.
#[derive(Debug, Clone)]
pub enum Command {
    StartPrint { path: String },
    PausePrint,
    ResumePrint,
    StopPrint,
    ExecuteGcode { gcode: String, force: bool },
    LoadFilament(FilamentParams),
    UnloadFilament(FilamentParams),
    ResetPrinter,
    JobInfo,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartPrint { .. } => "start print",
            Command::PausePrint => "pause print",
            Command::ResumePrint => "resume print",
            Command::StopPrint => "stop print",
            Command::ExecuteGcode { .. } => "execute gcode",
            Command::LoadFilament(_) => "load filament",
            Command::UnloadFilament(_) => "unload filament",
            Command::ResetPrinter => "reset printer",
            Command::JobInfo => "job info",
        }
    }
}

/// One command paired with who asked for it.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command_id: Option<u32>,
    pub source: Source,
    pub command: Command,
}

/// A finished command, failure converted into a response payload.
#[derive(Debug)]
pub struct CommandOutcome {
    pub command_id: Option<u32>,
    pub result: Result<Value, CommandError>,
}

impl CommandRequest {
    pub fn new(command: Command, source: Source, command_id: Option<u32>) -> Self {
        Self {
            command_id,
            source,
            command,
        }
    }

    /// Runs the command and pairs whatever happened with the originating
    /// command id.
    pub async fn execute(&self, ctx: &CommandContext) -> CommandOutcome {
        info!(command = self.command.name(), command_id = ?self.command_id, "running command");
        let result = self.run(ctx).await;
        if let Err(err) = &result {
            warn!(command = self.command.name(), %err, "command failed");
        }
        CommandOutcome {
            command_id: self.command_id,
            result,
        }
    }

    pub async fn run(&self, ctx: &CommandContext) -> Result<Value, CommandError> {
        match &self.command {
            Command::StartPrint { path } => self.start_print(ctx, path).await,
            Command::PausePrint => self.pause_print(ctx).await,
            Command::ResumePrint => self.resume_print(ctx).await,
            Command::StopPrint => self.stop_print(ctx).await,
            Command::ExecuteGcode { gcode, force } => {
                self.execute_gcode(ctx, gcode, *force).await
            }
            Command::LoadFilament(params) => self.filament(ctx, params, "M701").await,
            Command::UnloadFilament(params) => self.filament(ctx, params, "M702").await,
            Command::ResetPrinter => self.reset_printer(ctx).await,
            Command::JobInfo => self.job_info(ctx),
        }
    }

    // -- Shared helpers --

    /// Waits for one instruction in `QUIT_INTERVAL` slices; interruption
    /// and queue teardown both fail the command.
    async fn wait_while_running(
        &self,
        ctx: &CommandContext,
        instruction: &Arc<Instruction>,
    ) -> Result<(), CommandError> {
        loop {
            if !*ctx.running.borrow() {
                return Err(CommandError::Failed("Command interrupted".into()));
            }
            match tokio::time::timeout(QUIT_INTERVAL, instruction.wait()).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(CommandError::Failed("Command interrupted".into())),
                Err(_) => continue,
            }
        }
    }

    /// Front-enqueues one G-code line and waits for its confirmation.
    async fn do_instruction(
        &self,
        ctx: &CommandContext,
        gcode: &str,
    ) -> Result<Arc<Instruction>, CommandError> {
        let instruction = ctx.queue.enqueue_plain(gcode, true);
        self.wait_while_running(ctx, &instruction).await?;
        Ok(instruction)
    }

    /// Front-enqueues a matchable line and waits for its confirmation.
    async fn do_matchable(
        &self,
        ctx: &CommandContext,
        gcode: &str,
        regex: &'static regex::Regex,
    ) -> Result<Arc<Instruction>, CommandError> {
        let instruction = ctx.queue.enqueue_matchable(gcode, regex, true);
        self.wait_while_running(ctx, &instruction).await?;
        Ok(instruction)
    }

    /// Sends a G-code in hopes of reaching one of the desired states,
    /// waiting up to `STATE_CHANGE_TIMEOUT` for the transition.
    async fn try_until_state(
        &self,
        ctx: &CommandContext,
        gcode: &str,
        desired: &[State],
    ) -> Result<(), CommandError> {
        let desired_set: HashSet<State> = desired.iter().copied().collect();
        let state_names = desired
            .iter()
            .map(|state| state.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        if !desired_set.contains(&ctx.state.get_state()) {
            let mut change = StateChange::new().command_id(self.command_id);
            for state in &desired_set {
                change = change.to_state(*state, self.source);
            }
            ctx.state.expect_change(change);
        }
        debug!(states = %state_names, "trying to reach one of the desired states");

        let reached = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let token = {
            let desired_set = desired_set.clone();
            let reached = Arc::clone(&reached);
            let notify = Arc::clone(&notify);
            ctx.state.state_changed_signal().connect(move |event| {
                if desired_set.contains(&event.to) {
                    reached.store(true, Ordering::SeqCst);
                    notify.notify_one();
                }
            })
        };

        let result = async {
            self.do_instruction(ctx, gcode).await?;

            // Crush the edge case where we already are where we want to be.
            if desired_set.contains(&ctx.state.get_state()) {
                reached.store(true, Ordering::SeqCst);
            }

            let deadline = tokio::time::Instant::now() + STATE_CHANGE_TIMEOUT;
            while !reached.load(Ordering::SeqCst) {
                if !*ctx.running.borrow() {
                    return Err(CommandError::Failed("Command interrupted".into()));
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(CommandError::TimedOut(format!(
                        "Couldn't get to any of {state_names} states."
                    )));
                }
                let _ = tokio::time::timeout(QUIT_INTERVAL, notify.notified()).await;
            }
            Ok(())
        }
        .await;

        ctx.state.state_changed_signal().disconnect(token);
        ctx.state.stop_expecting_change();
        result
    }

    /// Refuses commands that must not run in a busy or broken printer.
    fn refuse_in_busy_states(&self, ctx: &CommandContext) -> Result<(), CommandError> {
        let state = ctx.state.get_state();
        if matches!(state, State::Printing | State::Attention | State::Error) {
            return Err(CommandError::Refused(format!(
                "Can't run {} while in {state} state.",
                self.command.name()
            )));
        }
        Ok(())
    }

    // -- start print --

    async fn start_print(&self, ctx: &CommandContext, path: &str) -> Result<Value, CommandError> {
        // No new jobs while printing or in an override state.
        if ctx.state.printing_layer().is_some() {
            return Err(CommandError::Refused("Already printing".into()));
        }
        if ctx.state.override_layer().is_some() {
            return Err(CommandError::Refused(format!(
                "Cannot print in {} state.",
                ctx.state.get_state()
            )));
        }

        ctx.state.expect_change(
            StateChange::new()
                .to_state(State::Printing, self.source)
                .command_id(self.command_id),
        );

        let result = async {
            if let Some(sd_path) = sd_path_of(path, &ctx.options.sd_mount_name) {
                self.load_sd_file(ctx, &sd_path).await?;
                self.do_instruction(ctx, "M24").await?;
            } else {
                let os_path = ctx.storage.os_path(path).ok_or_else(|| {
                    CommandError::Failed(format!("The file at {path} does not exist."))
                })?;
                ctx.stats.track_new_print(&os_path).await.map_err(|err| {
                    CommandError::Failed(format!("Cannot analyze the file at {path}: {err}"))
                })?;
                ctx.file_printer
                    .start(&os_path)
                    .await
                    .map_err(|err| CommandError::Failed(err.to_string()))?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            ctx.state.stop_expecting_change();
            return Err(err);
        }

        ctx.job.set_file_path(path);
        ctx.state.printing();
        ctx.state.stop_expecting_change();
        Ok(Value::Null)
    }

    /// Selects a file on the SD card, translating the long path to its
    /// 8.3 form when the listing knows it.
    async fn load_sd_file(&self, ctx: &CommandContext, sd_path: &str) -> Result<(), CommandError> {
        let short_path = ctx
            .sd
            .short_path_for(sd_path)
            .unwrap_or_else(|| sd_path.to_string());
        // The firmware wants the 8.3 path in lower case.
        let short_path = short_path.to_lowercase();

        let instruction = self
            .do_matchable(ctx, &format!("M23 {short_path}"), &OPEN_RESULT_REGEX)
            .await?;
        if instruction.match_group("ok").is_none() {
            return Err(CommandError::Failed(format!(
                "Wrong file name, or bad file. File name: {short_path}"
            )));
        }
        Ok(())
    }

    // -- pause / resume / stop --

    async fn pause_print(&self, ctx: &CommandContext) -> Result<Value, CommandError> {
        if ctx.state.get_state() != State::Printing {
            return Err(CommandError::Refused("Cannot pause when not printing.".into()));
        }
        if ctx.file_printer.is_printing() {
            ctx.file_printer.pause().await;
        }
        self.try_until_state(ctx, "M601", &[State::Paused]).await?;
        Ok(Value::Null)
    }

    async fn resume_print(&self, ctx: &CommandContext) -> Result<Value, CommandError> {
        if ctx.state.get_state() != State::Paused {
            return Err(CommandError::Refused("Cannot resume when not paused.".into()));
        }
        // A file print recognizes the resume from the serial line itself.
        self.try_until_state(ctx, "M602", &[State::Printing]).await?;
        Ok(Value::Null)
    }

    async fn stop_print(&self, ctx: &CommandContext) -> Result<Value, CommandError> {
        let job_id = ctx.job.job_id();
        if ctx.file_printer.is_printing() {
            ctx.file_printer.stop().await;
        }
        self.try_until_state(
            ctx,
            "M603",
            &[State::Stopped, State::Finished, State::Ready],
        )
        .await?;
        Ok(json!({ "job_id": job_id }))
    }

    // -- execute gcode --

    async fn execute_gcode(
        &self,
        ctx: &CommandContext,
        gcode: &str,
        force: bool,
    ) -> Result<Value, CommandError> {
        if force {
            debug!(gcode, "force sending gcode");
        } else {
            self.refuse_in_busy_states(ctx)?;
        }

        // The first resulting state change belongs to the caller; later
        // ones fall back onto the observers' defaults.
        ctx.state.expect_change(
            StateChange::new()
                .command_id(self.command_id)
                .default_source(self.source),
        );

        let lines: Vec<String> = gcode
            .lines()
            .map(|line| line.replace('\r', ""))
            .filter(|line| !line.trim().is_empty())
            .collect();
        let instructions = ctx.queue.enqueue_list(lines, &REJECTION_REGEX);

        let result = async {
            for instruction in &instructions {
                self.wait_while_running(ctx, instruction).await?;
                if instruction.matched_line().is_some() {
                    return Err(CommandError::Failed(format!(
                        "Unknown command '{}'",
                        instruction.gcode()
                    )));
                }
            }
            Ok(Value::Null)
        }
        .await;

        ctx.state.stop_expecting_change();
        result
    }

    // -- filament --

    /// Preheats, then runs the load or unload cycle.
    ///
    /// The preheat does not block: the filament instruction itself waits
    /// on the firmware, which only acts once temperatures are reached.
    async fn filament(
        &self,
        ctx: &CommandContext,
        params: &FilamentParams,
        gcode: &str,
    ) -> Result<Value, CommandError> {
        self.refuse_in_busy_states(ctx)?;

        let target_extrude_temp = params.nozzle_temperature as f64 * EXTRUDE_TEMP_RATIO;

        ctx.queue
            .enqueue_plain(format!("M140 S{}", params.bed_temperature), false);

        // M109 S should wait for heating only, but the firmware version in
        // the field waits for cooling too; skip it when already hot.
        let nozzle = ctx.telemetry.nozzle_temperature();
        if nozzle.is_none() || nozzle.is_some_and(|temp| temp < target_extrude_temp) {
            ctx.queue
                .enqueue_plain(format!("M109 S{}", params.nozzle_temperature), false);
        }
        ctx.queue
            .enqueue_plain(format!("M104 S{target_extrude_temp:.0}"), false);

        let instruction = ctx.queue.enqueue_plain(gcode, false);
        self.wait_while_running(ctx, &instruction).await?;
        Ok(Value::Null)
    }

    // -- reset printer --

    async fn reset_printer(&self, ctx: &CommandContext) -> Result<Value, CommandError> {
        if ctx.options.reset_pin == GROUNDED_RESET_PIN {
            return Err(CommandError::Refused(format!(
                "Pin BCM_{GROUNDED_RESET_PIN} is by default connected straight to ground. \
                 This would destroy your pin."
            )));
        }

        let booted = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let token = {
            let booted = Arc::clone(&booted);
            let notify = Arc::clone(&notify);
            ctx.matcher.add_handler(&PRINTER_BOOT_REGEX, move |_| {
                booted.store(true, Ordering::SeqCst);
                notify.notify_one();
            })
        };

        ctx.state.expect_change(
            StateChange::new()
                .default_source(self.source)
                .command_id(self.command_id),
        );

        let result = async {
            let used_gpio = ctx
                .reset
                .hardware_reset()
                .await
                .map_err(|err| CommandError::Failed(format!("GPIO reset failed: {err}")))?;
            if !used_gpio {
                ctx.reset
                    .blip_dtr()
                    .await
                    .map_err(|err| CommandError::Failed(format!("DTR reset failed: {err}")))?;
            }

            let deadline = tokio::time::Instant::now() + RESET_TIMEOUT;
            while !booted.load(Ordering::SeqCst) {
                if !*ctx.running.borrow() {
                    return Err(CommandError::Failed("Command interrupted".into()));
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(CommandError::TimedOut(
                        "Your printer has ignored the reset signal, your board is broken, \
                         you have configured a wrong pin, or the serial reading component broke."
                            .into(),
                    ));
                }
                let _ = tokio::time::timeout(QUIT_INTERVAL, notify.notified()).await;
            }
            Ok(Value::Null)
        }
        .await;

        if let Err(err) = ctx.matcher.remove_handler(&token) {
            warn!(%err, "boot waiter already removed");
        }
        if result.is_err() {
            ctx.state.stop_expecting_change();
        } else {
            ctx.state.reset();
        }
        result
    }

    // -- job info --

    fn job_info(&self, ctx: &CommandContext) -> Result<Value, CommandError> {
        if ctx.job.job_state() == JobState::Idle {
            return Err(CommandError::Refused(
                "Cannot get job info, when there is no job in progress.".into(),
            ));
        }
        let Some(job_id) = ctx.job.job_id() else {
            return Err(CommandError::Failed(
                "Cannot get job info, don't know the job id yet.".into(),
            ));
        };
        // Happens when launching into a paused print.
        let Some(file_path) = ctx.job.selected_file_path() else {
            return Err(CommandError::Failed(
                "Cannot get job info, don't know the file details yet.".into(),
            ));
        };

        let state = ctx.state.get_state();
        let mut response = json!({
            "job_id": job_id,
            "state": state.to_string(),
            "file_path": file_path,
        });

        // Progress estimation only means anything mid-print; the segment
        // clock is running then, so reading it is safe.
        if state == State::Printing {
            let fields = response.as_object_mut().expect("job info is a map");
            fields.insert(
                "time_printing".to_string(),
                json!(ctx.stats.time_printing().as_secs()),
            );
            if let Some(gcode_number) = ctx.file_printer.gcode_number() {
                if let Some((progress, minutes_remaining)) = ctx.stats.get_stats(gcode_number) {
                    fields.insert("progress".to_string(), json!(progress));
                    fields.insert("time_remaining".to_string(), json!(minutes_remaining));
                }
            }
        }

        debug!(%response, "job info retrieved");
        Ok(response)
    }
}

/// Splits the SD-card part off a long path when the first segment is the
/// SD mount name; `/SD Card/dir/a.gcode` becomes `/dir/a.gcode`.
fn sd_path_of(path: &str, mount_name: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != mount_name {
        return None;
    }
    let rest: Vec<&str> = segments.collect();
    Some(format!("/{}", rest.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::link::PortCommand;
    use crate::state::{StateChangedEvent, StateOptions};
    use printer_protocol::frame_line;
    use std::io::Write;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct StubFilePrinter {
        started: Mutex<Vec<PathBuf>>,
        progress: Mutex<Option<u64>>,
    }

    #[async_trait]
    impl FilePrinter for StubFilePrinter {
        fn is_printing(&self) -> bool {
            false
        }
        fn gcode_number(&self) -> Option<u64> {
            *self.progress.lock().unwrap()
        }
        async fn start(&self, os_path: &std::path::Path) -> anyhow::Result<()> {
            self.started.lock().unwrap().push(os_path.to_path_buf());
            Ok(())
        }
        async fn pause(&self) {}
        async fn stop(&self) {}
    }

    struct StubStorage {
        gcode_file: PathBuf,
    }

    impl LocalStorage for StubStorage {
        fn os_path(&self, virtual_path: &str) -> Option<PathBuf> {
            (virtual_path == "/local/part.gcode").then(|| self.gcode_file.clone())
        }
    }

    struct StubTelemetry(Option<f64>);

    impl Telemetry for StubTelemetry {
        fn nozzle_temperature(&self) -> Option<f64> {
            self.0
        }
    }

    #[derive(Default)]
    struct StubReset {
        gpio_capable: bool,
        resets: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ResetShim for StubReset {
        async fn hardware_reset(&self) -> anyhow::Result<bool> {
            if self.gpio_capable {
                self.resets.lock().unwrap().push("gpio");
            }
            Ok(self.gpio_capable)
        }
        async fn blip_dtr(&self) -> anyhow::Result<()> {
            self.resets.lock().unwrap().push("dtr");
            Ok(())
        }
    }

    struct Rig {
        ctx: CommandContext,
        port_rx: mpsc::Receiver<PortCommand>,
        file_printer: Arc<StubFilePrinter>,
        reset: Arc<StubReset>,
        gcode_path: PathBuf,
        _gcode_file: tempfile::NamedTempFile,
        _running_tx: watch::Sender<bool>,
    }

    fn rig(spawn_queue: bool) -> Rig {
        rig_with_telemetry(spawn_queue, Some(25.0))
    }

    fn rig_with_telemetry(spawn_queue: bool, nozzle_temp: Option<f64>) -> Rig {
        let (port_tx, port_rx) = mpsc::channel(64);
        let (running_tx, running_rx) = watch::channel(true);
        let matcher = Arc::new(LineMatcher::new());
        let queue = SerialQueue::new(port_tx, running_rx.clone());
        if spawn_queue {
            tokio::spawn(Arc::clone(&queue).run());
        }
        let state = StateManager::new(StateOptions::default());
        let sd = SdCardWatch::new(
            Arc::clone(&queue),
            Arc::clone(&state),
            None,
            running_rx.clone(),
        );
        let reset = Arc::new(StubReset::default());
        let file_printer = Arc::new(StubFilePrinter::default());

        let mut gcode_file = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..100 {
            writeln!(gcode_file, "G1 X1").unwrap();
        }
        let gcode_path = gcode_file.path().to_path_buf();

        let ctx = CommandContext {
            queue,
            state,
            matcher,
            sd,
            job: Job::new(),
            stats: Arc::new(PrintStats::new()),
            file_printer: Arc::clone(&file_printer) as Arc<dyn FilePrinter>,
            storage: Arc::new(StubStorage {
                gcode_file: gcode_path.clone(),
            }),
            telemetry: Arc::new(StubTelemetry(nozzle_temp)),
            reset: Arc::clone(&reset) as Arc<dyn ResetShim>,
            running: running_rx,
            options: CommandOptions::default(),
        };
        Rig {
            ctx,
            port_rx,
            file_printer,
            reset,
            gcode_path,
            _gcode_file: gcode_file,
            _running_tx: running_tx,
        }
    }

    fn make_ready(ctx: &CommandContext) {
        ctx.state.not_printing();
        ctx.state.instruction_confirmed();
        assert_eq!(ctx.state.get_state(), State::Ready);
    }

    fn make_printing(ctx: &CommandContext) {
        ctx.state.not_printing();
        ctx.state.instruction_confirmed();
        ctx.state.printing();
        assert_eq!(ctx.state.get_state(), State::Printing);
    }

    /// Consumes and confirms the session's line counter reset.
    async fn open_session(rig: &mut Rig) {
        let queue = Arc::clone(&rig.ctx.queue);
        open_session_on(&queue, &mut rig.port_rx).await;
    }

    /// Same as `open_session`, but usable once `rig.ctx` has been moved
    /// elsewhere (e.g. into a spawned task), given the already-cloned queue.
    async fn open_session_on(queue: &Arc<SerialQueue>, port_rx: &mut mpsc::Receiver<PortCommand>) {
        assert_eq!(next_frame(port_rx).await, frame_line(0, "M110 N0"));
        queue.line_received("ok");
    }

    async fn next_frame(port_rx: &mut mpsc::Receiver<PortCommand>) -> String {
        match tokio::time::timeout(Duration::from_secs(5), port_rx.recv())
            .await
            .expect("no frame within 5s")
            .expect("port channel closed")
        {
            PortCommand::Write(bytes) => String::from_utf8(bytes).unwrap(),
            PortCommand::BlipDtr(_) => panic!("unexpected DTR request"),
        }
    }

    fn collect_events(state: &StateManager) -> Arc<Mutex<Vec<StateChangedEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        state
            .state_changed_signal()
            .connect(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[tokio::test]
    async fn test_pause_print_reaches_paused_with_user_source() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_printing(&rig.ctx);
        let events = collect_events(&rig.ctx.state);

        let queue = Arc::clone(&rig.ctx.queue);
        let state = Arc::clone(&rig.ctx.state);
        let request = CommandRequest::new(Command::PausePrint, Source::User, Some(9));
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "M601"));

        // The firmware confirms, then reports the pause on the serial line.
        queue.line_received("ok");
        state.paused();

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("pause command hung")
            .unwrap();
        assert!(result.is_ok());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1, "exactly one reported-state edge");
        assert_eq!(events[0].to, State::Paused);
        assert_eq!(events[0].source, Some(Source::User));
        assert_eq!(events[0].command_id, Some(9));
    }

    #[tokio::test]
    async fn test_pause_refused_when_not_printing() {
        let rig = rig(false);
        make_ready(&rig.ctx);

        let request = CommandRequest::new(Command::PausePrint, Source::User, None);
        let result = request.run(&rig.ctx).await;
        assert!(matches!(result, Err(CommandError::Refused(_))));
    }

    #[tokio::test]
    async fn test_resume_refused_when_not_paused() {
        let rig = rig(false);
        make_ready(&rig.ctx);

        let request = CommandRequest::new(Command::ResumePrint, Source::User, None);
        assert!(matches!(
            request.run(&rig.ctx).await,
            Err(CommandError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_print_short_circuits_when_already_stopped() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_ready(&rig.ctx);
        rig.ctx.job.job_started(3);

        let queue = Arc::clone(&rig.ctx.queue);
        let request = CommandRequest::new(Command::StopPrint, Source::Connect, Some(1));
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        // READY is already a desired state; only the M603 confirmation is
        // awaited, no transition has to happen.
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "M603"));
        queue.line_received("ok");

        let result = runner.await.unwrap().unwrap();
        assert_eq!(result, json!({ "job_id": 3 }));
    }

    #[tokio::test]
    async fn test_execute_gcode_runs_lines_in_order() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_ready(&rig.ctx);

        let queue = Arc::clone(&rig.ctx.queue);
        let request = CommandRequest::new(
            Command::ExecuteGcode {
                gcode: "G28\r\nM105\n\n".to_string(),
                force: false,
            },
            Source::Connect,
            Some(5),
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "G28"));
        queue.line_received("ok");
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(2, "M105"));
        queue.line_received("ok");

        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_execute_gcode_fails_on_rejection() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_ready(&rig.ctx);

        let queue = Arc::clone(&rig.ctx.queue);
        let request = CommandRequest::new(
            Command::ExecuteGcode {
                gcode: "M99999".to_string(),
                force: false,
            },
            Source::Connect,
            None,
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        open_session_on(&queue, &mut rig.port_rx).await;
        queue.line_received(r#"echo:Unknown command: "M99999""#);
        queue.line_received("ok");

        let result = runner.await.unwrap();
        assert!(matches!(result, Err(CommandError::Failed(_))));
    }

    #[tokio::test]
    async fn test_execute_gcode_refused_while_printing_unless_forced() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_printing(&rig.ctx);

        let request = CommandRequest::new(
            Command::ExecuteGcode {
                gcode: "G28".to_string(),
                force: false,
            },
            Source::User,
            None,
        );
        assert!(matches!(
            request.run(&rig.ctx).await,
            Err(CommandError::Refused(_))
        ));

        let queue = Arc::clone(&rig.ctx.queue);
        let forced = CommandRequest::new(
            Command::ExecuteGcode {
                gcode: "G28".to_string(),
                force: true,
            },
            Source::User,
            None,
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { forced.run(&ctx).await });

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "G28"));
        queue.line_received("ok");
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_start_print_from_sd_selects_and_starts() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_ready(&rig.ctx);
        let events = collect_events(&rig.ctx.state);

        let queue = Arc::clone(&rig.ctx.queue);
        let job = Arc::clone(&rig.ctx.job);
        let request = CommandRequest::new(
            Command::StartPrint {
                path: "/SD Card/TEST.GCO".to_string(),
            },
            Source::Connect,
            Some(11),
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        // No translation table entry: the supplied path is used as the
        // short path, lower cased.
        assert_eq!(
            next_frame(&mut rig.port_rx).await,
            frame_line(1, "M23 /test.gco")
        );
        queue.line_received("Now fresh file: test.gco");
        queue.line_received("ok");

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(2, "M24"));
        queue.line_received("ok");

        assert!(runner.await.unwrap().is_ok());
        assert_eq!(
            job.selected_file_path().as_deref(),
            Some("/SD Card/TEST.GCO")
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to, State::Printing);
        assert_eq!(events[0].source, Some(Source::Connect));
        assert_eq!(events[0].command_id, Some(11));
    }

    #[tokio::test]
    async fn test_start_print_from_sd_fails_on_open_failure() {
        let mut rig = rig(true);
        open_session(&mut rig).await;
        make_ready(&rig.ctx);

        let queue = Arc::clone(&rig.ctx.queue);
        let state = Arc::clone(&rig.ctx.state);
        let request = CommandRequest::new(
            Command::StartPrint {
                path: "/SD Card/missing.gco".to_string(),
            },
            Source::Connect,
            None,
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        open_session_on(&queue, &mut rig.port_rx).await;
        queue.line_received("open failed, File: missing.gco");
        queue.line_received("ok");

        assert!(matches!(
            runner.await.unwrap(),
            Err(CommandError::Failed(_))
        ));
        assert_eq!(state.get_state(), State::Ready, "no state change on failure");
    }

    #[tokio::test]
    async fn test_start_print_local_hands_off_to_file_printer() {
        let rig = rig(false);
        make_ready(&rig.ctx);

        let request = CommandRequest::new(
            Command::StartPrint {
                path: "/local/part.gcode".to_string(),
            },
            Source::User,
            None,
        );
        assert!(request.run(&rig.ctx).await.is_ok());

        assert_eq!(
            *rig.file_printer.started.lock().unwrap(),
            vec![rig.gcode_path.clone()]
        );
        assert_eq!(rig.ctx.state.get_state(), State::Printing);
        assert_eq!(
            rig.ctx.stats.total_gcode_count(),
            100,
            "the file must be analyzed before the handoff"
        );
    }

    #[tokio::test]
    async fn test_job_info_reports_progress_mid_print() {
        let rig = rig(false);
        make_ready(&rig.ctx);

        let start = CommandRequest::new(
            Command::StartPrint {
                path: "/local/part.gcode".to_string(),
            },
            Source::User,
            None,
        );
        start.run(&rig.ctx).await.unwrap();
        rig.ctx.job.job_started(4);
        *rig.file_printer.progress.lock().unwrap() = Some(25);

        let info = CommandRequest::new(Command::JobInfo, Source::Connect, None);
        let payload = info.run(&rig.ctx).await.unwrap();

        assert_eq!(payload["progress"], json!(25));
        assert!(payload.get("time_printing").is_some());
        assert!(payload.get("time_remaining").is_some());
    }

    #[tokio::test]
    async fn test_start_print_refused_while_printing() {
        let rig = rig(false);
        make_printing(&rig.ctx);

        let request = CommandRequest::new(
            Command::StartPrint {
                path: "/local/part.gcode".to_string(),
            },
            Source::User,
            None,
        );
        let result = request.run(&rig.ctx).await;
        match result {
            Err(CommandError::Refused(reason)) => assert_eq!(reason, "Already printing"),
            other => panic!("expected a refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reset_refused_on_grounded_pin() {
        let mut rig = rig(false);
        rig.ctx.options.reset_pin = GROUNDED_RESET_PIN;

        let request = CommandRequest::new(Command::ResetPrinter, Source::User, Some(2));
        let result = request.run(&rig.ctx).await;

        assert!(matches!(result, Err(CommandError::Refused(_))));
        assert!(
            rig.port_rx.try_recv().is_err(),
            "no bytes may reach the serial line"
        );
        assert!(rig.reset.resets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_falls_back_to_dtr_and_waits_for_boot() {
        let rig = rig(false);
        let matcher = Arc::clone(&rig.ctx.matcher);
        let reset = Arc::clone(&rig.reset);

        let request = CommandRequest::new(Command::ResetPrinter, Source::User, None);
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        // Deliver the boot banner once the waiter is registered.
        for _ in 0..100 {
            matcher.feed("start");
            if runner.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("reset command hung")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(*reset.resets.lock().unwrap(), vec!["dtr"]);
    }

    #[tokio::test]
    async fn test_filament_load_preheats_and_waits() {
        // Hot nozzle: the M109 heat-and-wait is skipped.
        let mut rig = rig_with_telemetry(true, Some(230.0));
        open_session(&mut rig).await;
        make_ready(&rig.ctx);

        let queue = Arc::clone(&rig.ctx.queue);
        let request = CommandRequest::new(
            Command::LoadFilament(FilamentParams {
                bed_temperature: 60,
                nozzle_temperature: 240,
            }),
            Source::User,
            None,
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        for expected in ["M140 S60", "M104 S216", "M701"] {
            let frame = next_frame(&mut rig.port_rx).await;
            assert!(
                frame.contains(expected),
                "expected {expected} in frame {frame}"
            );
            queue.line_received("ok");
        }
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_filament_preheats_nozzle_when_cold() {
        let mut rig = rig_with_telemetry(true, Some(25.0));
        open_session(&mut rig).await;
        make_ready(&rig.ctx);

        let queue = Arc::clone(&rig.ctx.queue);
        let request = CommandRequest::new(
            Command::UnloadFilament(FilamentParams {
                bed_temperature: 60,
                nozzle_temperature: 240,
            }),
            Source::User,
            None,
        );
        let ctx = rig.ctx;
        let runner = tokio::spawn(async move { request.run(&ctx).await });

        for expected in ["M140 S60", "M109 S240", "M104 S216", "M702"] {
            let frame = next_frame(&mut rig.port_rx).await;
            assert!(
                frame.contains(expected),
                "expected {expected} in frame {frame}"
            );
            queue.line_received("ok");
        }
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_job_info_preconditions_and_payload() {
        let rig = rig(false);

        let request = CommandRequest::new(Command::JobInfo, Source::Connect, None);
        assert!(matches!(
            request.run(&rig.ctx).await,
            Err(CommandError::Refused(_))
        ));

        rig.ctx.job.job_started(12);
        assert!(matches!(
            request.run(&rig.ctx).await,
            Err(CommandError::Failed(_))
        ));

        rig.ctx.job.set_file_path("/SD Card/benchy boat.gcode");
        let payload = request.run(&rig.ctx).await.unwrap();
        assert_eq!(payload["job_id"], json!(12));
        assert_eq!(payload["file_path"], json!("/SD Card/benchy boat.gcode"));
    }

    #[test]
    fn test_sd_path_splitting() {
        assert_eq!(
            sd_path_of("/SD Card/dir/a.gcode", "SD Card"),
            Some("/dir/a.gcode".to_string())
        );
        assert_eq!(
            sd_path_of("/SD Card/a.gcode", "SD Card"),
            Some("/a.gcode".to_string())
        );
        assert_eq!(sd_path_of("/local/a.gcode", "SD Card"), None);
        assert_eq!(sd_path_of("a.gcode", "SD Card"), None);
    }
}
