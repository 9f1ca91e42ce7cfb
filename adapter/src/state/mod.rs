//! # Printer State Machine
//!
//! Keeps track of the printer state by observing the serial line and by
//! listening to the other adapter components. Three layers are fused into
//! one reported state, most important first:
//!
//! 1. override state (`ERROR` / `ATTENTION`)
//! 2. printing state (`PRINTING` / `PAUSED` / `FINISHED` / `STOPPED`)
//! 3. base state (`READY` / `BUSY`)
//!
//! Observation alone cannot correlate actions with reactions, so callers
//! about to cause a transition register a [`StateChange`] first; the next
//! observed transition consumes it and is attributed to that caller.
//!
//! All mutators run under a single state lock and finish by recomputing
//! the reported state; when it changed, `state_changed` fires exactly once
//! with the transition details. Signal handlers run inside that lock and
//! must not call back into the manager.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use regex::Captures;
use tracing::{debug, warn};

use printer_protocol::{
    BaseState, OverrideState, PrintingState, Source, State, ATTENTION_REGEX, BUSY_REGEX,
    CANCEL_REGEX, ERROR_REASON_TIMEOUT, ERROR_REGEX, FAN_ERROR_REGEX, PAUSED_REGEX,
    PRINT_DONE_REGEX, RESUMED_REGEX, START_PRINT_REGEX, STATE_HISTORY_SIZE,
};

use crate::serial::matcher::{LineMatcher, MatchToken};
use crate::signal::Signal;

/// A pre-registered hint describing a transition somebody is about to
/// cause, used to attribute the next observed state change.
#[derive(Debug, Clone, Default)]
pub struct StateChange {
    pub command_id: Option<u32>,
    pub to_states: HashMap<State, Source>,
    pub from_states: HashMap<State, Source>,
    pub default_source: Option<Source>,
    pub reason: Option<String>,
    pub checked: bool,
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_state(mut self, state: State, source: Source) -> Self {
        self.to_states.insert(state, source);
        self
    }

    pub fn from_state(mut self, state: State, source: Source) -> Self {
        self.from_states.insert(state, source);
        self
    }

    pub fn default_source(mut self, source: Source) -> Self {
        self.default_source = Some(source);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn checked(mut self, checked: bool) -> Self {
        self.checked = checked;
        self
    }

    pub fn command_id(mut self, command_id: Option<u32>) -> Self {
        self.command_id = command_id;
        self
    }
}

/// Payload of the `state_changed` signal.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub from: State,
    pub to: State,
    pub command_id: Option<u32>,
    pub source: Option<Source>,
    pub reason: Option<String>,
    pub checked: bool,
}

/// Behavior switches mirrored from the adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    /// When set, FINISHED / STOPPED survive ordinary confirmations and
    /// only clear on an explicit user acknowledgement.
    pub m0_after_prints: bool,
}

struct StateData {
    base_state: BaseState,
    printing_state: Option<PrintingState>,
    override_state: Option<OverrideState>,
    state_history: VecDeque<State>,
    last_state: State,
    current_state: State,
    error_count: u32,
    expected_change: Option<StateChange>,
    fan_error_name: Option<String>,
    unsure_whether_printing: bool,
    awaiting_error_reason: bool,
    reason_generation: u64,
}

/// The three-layer state fusion with expected-change attribution.
pub struct StateManager {
    inner: Mutex<StateData>,
    options: StateOptions,
    pre_state_change_signal: Signal<Option<u32>>,
    state_changed_signal: Signal<StateChangedEvent>,
    post_state_change_signal: Signal<()>,
    reason_cancel: tokio::sync::Notify,
    handler_tokens: Mutex<Vec<MatchToken>>,
}

impl StateManager {
    pub fn new(options: StateOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StateData {
                base_state: BaseState::Busy,
                printing_state: None,
                override_state: None,
                state_history: VecDeque::new(),
                last_state: State::Busy,
                current_state: State::Busy,
                error_count: 0,
                expected_change: None,
                fan_error_name: None,
                unsure_whether_printing: true,
                awaiting_error_reason: false,
                reason_generation: 0,
            }),
            options,
            pre_state_change_signal: Signal::new(),
            state_changed_signal: Signal::new(),
            post_state_change_signal: Signal::new(),
            reason_cancel: tokio::sync::Notify::new(),
            handler_tokens: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes the manager to the serial line families it observes.
    pub fn register_handlers(self: &Arc<Self>, matcher: &LineMatcher) {
        let mut tokens = self.handler_tokens.lock().expect("handler tokens poisoned");

        let simple: [(&'static once_cell::sync::Lazy<regex::Regex>, fn(&StateManager)); 7] = [
            (&BUSY_REGEX, StateManager::busy),
            (&ATTENTION_REGEX, StateManager::attention),
            (&PAUSED_REGEX, StateManager::paused),
            (&RESUMED_REGEX, StateManager::resumed),
            (&CANCEL_REGEX, StateManager::stopped_or_not_printing),
            (&START_PRINT_REGEX, StateManager::printing),
            (&PRINT_DONE_REGEX, StateManager::finished),
        ];
        for (pattern, method) in simple {
            let weak = Arc::downgrade(self);
            tokens.push(matcher.add_handler(pattern, move |_| {
                if let Some(manager) = weak.upgrade() {
                    method(&manager);
                }
            }));
        }

        let weak = Arc::downgrade(self);
        tokens.push(matcher.add_handler(&ERROR_REGEX, move |captures| {
            if let Some(manager) = weak.upgrade() {
                manager.observed_error_line(captures);
            }
        }));

        let weak: Weak<StateManager> = Arc::downgrade(self);
        tokens.push(matcher.add_handler(&FAN_ERROR_REGEX, move |captures| {
            if let Some(manager) = weak.upgrade() {
                manager.fan_error(&captures["fan_name"]);
            }
        }));
    }

    /// Detaches every serial handler; part of teardown.
    pub fn detach(&self, matcher: &LineMatcher) {
        let tokens: Vec<MatchToken> = self
            .handler_tokens
            .lock()
            .expect("handler tokens poisoned")
            .drain(..)
            .collect();
        for token in tokens {
            if let Err(err) = matcher.remove_handler(&token) {
                warn!(%err, "state manager handler already removed");
            }
        }
    }

    // -- Signals --

    pub fn pre_state_change_signal(&self) -> &Signal<Option<u32>> {
        &self.pre_state_change_signal
    }

    pub fn state_changed_signal(&self) -> &Signal<StateChangedEvent> {
        &self.state_changed_signal
    }

    pub fn post_state_change_signal(&self) -> &Signal<()> {
        &self.post_state_change_signal
    }

    // -- Reported state --

    /// The reported state: the first occupied layer from the top.
    pub fn get_state(&self) -> State {
        Self::fused(&self.lock())
    }

    pub fn printing_layer(&self) -> Option<PrintingState> {
        self.lock().printing_state
    }

    pub fn override_layer(&self) -> Option<OverrideState> {
        self.lock().override_state
    }

    pub fn error_count(&self) -> u32 {
        self.lock().error_count
    }

    pub fn state_history(&self) -> Vec<State> {
        self.lock().state_history.iter().copied().collect()
    }

    pub fn awaiting_error_reason(&self) -> bool {
        self.lock().awaiting_error_reason
    }

    // -- Expected changes --

    /// Registers the hint that attributes the next observed transition.
    pub fn expect_change(&self, change: StateChange) {
        self.lock().expected_change = Some(change);
    }

    /// Clears a registered hint that never got consumed.
    pub fn stop_expecting_change(&self) {
        self.lock().expected_change = None;
    }

    // -- Error bookkeeping --

    /// Increments the error counter and raises the ERROR override.
    pub fn hardware_error_detected(&self) {
        {
            let mut data = self.lock();
            data.error_count += 1;
            debug!(error_count = data.error_count, "error count increased");
        }
        self.error();
    }

    /// Decrements the error counter; clears ERROR once it reaches zero.
    pub fn hardware_error_resolved(&self) {
        let cleared = {
            let mut data = self.lock();
            if data.error_count == 0 {
                warn!("error resolved with no error outstanding");
            }
            data.error_count = data.error_count.saturating_sub(1);
            debug!(error_count = data.error_count, "error count decreased");
            data.error_count == 0
        };
        if cleared {
            self.error_resolved();
        }
    }

    // -- State changing methods --

    /// If we were ready, the base state drops back to BUSY.
    pub fn busy(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Busy, Source::Marlin)),
            |data| {
                if data.base_state == BaseState::Ready {
                    data.base_state = BaseState::Busy;
                }
            },
        );
    }

    /// If not printing or paused, the printing state becomes PRINTING.
    pub fn printing(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Printing, Source::User)),
            |data| match data.printing_state {
                None | Some(PrintingState::Paused) => {
                    data.unsure_whether_printing = false;
                    data.printing_state = Some(PrintingState::Printing);
                }
                Some(other) => {
                    debug!(?other, "ignoring switch to PRINTING");
                }
            },
        );
    }

    /// We know we are not printing. FINISHED and STOPPED survive because
    /// the user has to acknowledge those manually.
    pub fn not_printing(&self) {
        self.influence(
            Some(
                StateChange::new()
                    .from_state(State::Printing, Source::Marlin)
                    .from_state(State::Paused, Source::Marlin),
            ),
            |data| {
                data.unsure_whether_printing = false;
                if !matches!(
                    data.printing_state,
                    Some(PrintingState::Finished) | Some(PrintingState::Stopped)
                ) {
                    data.printing_state = None;
                }
            },
        );
    }

    /// Depending on the printing layer, either a stop or a plain clear.
    pub fn stopped_or_not_printing(&self) {
        if self.lock().printing_state == Some(PrintingState::Printing) {
            self.stopped();
        } else {
            self.not_printing();
        }
    }

    /// On printer reset the boot is not done yet, so go BUSY; the printer
    /// surely cannot carry on printing either.
    pub fn reset(&self) {
        self.busy();
        self.stopped_or_not_printing();
    }

    pub fn finished(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Finished, Source::Marlin)),
            |data| {
                if data.printing_state == Some(PrintingState::Printing) {
                    data.printing_state = Some(PrintingState::Finished);
                }
            },
        );
    }

    /// Pauses from the user and from the G-code cannot be told apart.
    pub fn paused(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Paused, Source::User)),
            |data| {
                if matches!(data.printing_state, Some(PrintingState::Printing) | None) {
                    data.unsure_whether_printing = false;
                    data.printing_state = Some(PrintingState::Paused);
                }
            },
        );
    }

    pub fn resumed(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Printing, Source::User)),
            |data| {
                if data.printing_state == Some(PrintingState::Paused) {
                    data.unsure_whether_printing = false;
                    data.printing_state = Some(PrintingState::Printing);
                }
            },
        );
    }

    pub fn stopped(&self) {
        self.influence(
            Some(StateChange::new().from_state(State::Printing, Source::User)),
            |data| {
                if matches!(
                    data.printing_state,
                    Some(PrintingState::Printing) | Some(PrintingState::Paused)
                ) {
                    data.unsure_whether_printing = false;
                    data.printing_state = Some(PrintingState::Stopped);
                }
            },
        );
    }

    /// Instruction confirmation clears all temporary states, starting at
    /// the least important so only one reported change is generated.
    pub fn instruction_confirmed(&self) {
        let m0_after_prints = self.options.m0_after_prints;
        self.influence(
            Some(
                StateChange::new()
                    .to_state(State::Ready, Source::Marlin)
                    .from_state(State::Attention, Source::User)
                    .from_state(State::Error, Source::Marlin)
                    .from_state(State::Busy, Source::Hw)
                    .from_state(State::Finished, Source::Marlin)
                    .from_state(State::Stopped, Source::Marlin),
            ),
            |data| {
                if data.unsure_whether_printing {
                    return;
                }

                if data.base_state == BaseState::Busy {
                    data.base_state = BaseState::Ready;
                }

                if !m0_after_prints
                    && matches!(
                        data.printing_state,
                        Some(PrintingState::Stopped) | Some(PrintingState::Finished)
                    )
                {
                    data.printing_state = None;
                }

                if let Some(override_state) = data.override_state {
                    if override_state != OverrideState::Error {
                        debug!(?override_state, "confirmation clears the override");
                        data.override_state = None;
                    }
                }
            },
        );
    }

    /// The user acknowledged a finished or stopped print at the printer.
    pub fn printer_checked(&self) {
        self.influence(
            Some(
                StateChange::new()
                    .to_state(State::Ready, Source::Marlin)
                    .from_state(State::Finished, Source::User)
                    .from_state(State::Stopped, Source::User)
                    .checked(true),
            ),
            |data| {
                if matches!(
                    data.printing_state,
                    Some(PrintingState::Finished) | Some(PrintingState::Stopped)
                ) {
                    data.printing_state = None;
                }
            },
        );
    }

    /// Raises the ATTENTION override unless a finished or stopped print is
    /// waiting for its acknowledgement. Consumes a latched fan error.
    pub fn attention(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Attention, Source::User)),
            |data| {
                if let Some(fan_name) = data.fan_error_name.take() {
                    debug!(fan_name, "reporting the fan error observed earlier");
                    data.expected_change = Some(
                        StateChange::new()
                            .to_state(State::Attention, Source::Firmware)
                            .reason(format!("{fan_name} fan error")),
                    );
                }

                if !matches!(
                    data.printing_state,
                    Some(PrintingState::Finished) | Some(PrintingState::Stopped)
                ) {
                    warn!(state = %Self::fused(data), "overriding the state with ATTENTION");
                    data.override_state = Some(OverrideState::Attention);
                }
            },
        );
    }

    /// Raises the ERROR override.
    pub fn error(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Error, Source::Wui)),
            |data| {
                data.override_state = Some(OverrideState::Error);
            },
        );
    }

    /// Clears the ERROR override once no errors remain outstanding.
    pub fn error_resolved(&self) {
        self.influence(
            Some(StateChange::new().from_state(State::Error, Source::User)),
            |data| {
                if data.override_state == Some(OverrideState::Error) && data.error_count == 0 {
                    debug!("cancelling the ERROR state override");
                    data.override_state = None;
                }
            },
        );
    }

    /// ERROR raised by the serial link rather than the firmware.
    ///
    /// A lost session is terminal for this process, so there is no
    /// in-process resolution; the service supervisor restarts the adapter.
    pub fn serial_error(&self) {
        self.influence(
            Some(StateChange::new().to_state(State::Error, Source::Serial)),
            |data| {
                data.override_state = Some(OverrideState::Error);
            },
        );
    }

    // -- Error reasoning --

    /// Remembers a fan failure; the next ATTENTION transition reports it.
    pub fn fan_error(&self, fan_name: &str) {
        self.lock().fan_error_name = Some(fan_name.to_string());
    }

    /// Handles one matched error line.
    ///
    /// Specific errors carry their own explanation; generic halts start a
    /// bounded wait for one, and repeated halts restart that wait.
    pub fn observed_error_line(self: &Arc<Self>, captures: &Captures<'_>) {
        // Any error line ends the previous explanation wait.
        self.lock().reason_generation += 1;
        self.reason_cancel.notify_waiters();

        if let Some(reason) = Self::assemble_reason(captures) {
            self.expect_change(
                StateChange::new()
                    .to_state(State::Error, Source::Marlin)
                    .reason(reason),
            );
            self.hardware_error_detected();
            return;
        }

        let generic_halt =
            captures.name("stop").is_some() || captures.name("kill").is_some();
        let already_error = self.override_layer() == Some(OverrideState::Error);
        if generic_halt && !already_error {
            self.start_error_reason_wait();
        }
    }

    /// Waits `ERROR_REASON_TIMEOUT` for an explanation; without one the
    /// state goes to ERROR with a placeholder reason.
    fn start_error_reason_wait(self: &Arc<Self>) {
        let generation = {
            let mut data = self.lock();
            data.awaiting_error_reason = true;
            data.reason_generation
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let timed_out = tokio::select! {
                _ = manager.reason_cancel.notified() => false,
                _ = tokio::time::sleep(ERROR_REASON_TIMEOUT) => true,
            };

            let still_waiting = {
                let mut data = manager.lock();
                let current = data.reason_generation == generation;
                if current {
                    data.awaiting_error_reason = false;
                }
                current
            };

            if timed_out && still_waiting {
                warn!("did not capture any explanation for the error state");
                manager.expect_change(
                    StateChange::new()
                        .to_state(State::Error, Source::Marlin)
                        .reason("404 Reason not found"),
                );
                manager.hardware_error_detected();
            }
        });
    }

    /// Assembles a reason out of the error line's parsed groups; None for
    /// the generic halts that carry no explanation.
    fn assemble_reason(captures: &Captures<'_>) -> Option<String> {
        let mut reason = String::new();
        if captures.name("temp").is_some() {
            if captures.name("mintemp").is_some() {
                reason.push_str("Mintemp");
            } else if captures.name("maxtemp").is_some() {
                reason.push_str("Maxtemp");
            }
            reason.push_str(" triggered by the ");
            if captures.name("bed").is_some() {
                reason.push_str("heatbed thermistor.");
            } else {
                reason.push_str("hotend thermistor.");
            }
        } else if captures.name("runaway").is_some() {
            if captures.name("hotend_runaway").is_some() {
                reason.push_str("Hotend");
            } else if captures.name("heatbed_runaway").is_some() {
                reason.push_str("Heatbed");
            } else if captures.name("preheat_hotend").is_some() {
                reason.push_str("Hotend preheat");
            } else if captures.name("preheat_heatbed").is_some() {
                reason.push_str("Heatbed preheat");
            }
            reason.push_str(" thermal runaway.");
        } else if captures.name("bed_levelling").is_some() {
            reason.push_str(
                "Bed leveling failed. Sensor didn't trigger. Is there debris on the nozzle?",
            );
        } else {
            return None;
        }
        reason.push_str(" Manual restart required!");
        Some(reason)
    }

    // -- Internals --

    fn fused(data: &StateData) -> State {
        if let Some(override_state) = data.override_state {
            return override_state.into();
        }
        if let Some(printing_state) = data.printing_state {
            return printing_state.into();
        }
        data.base_state.into()
    }

    /// Runs a mutator under the state lock, installing `default_change`
    /// as the expectation unless one is already registered, then checks
    /// whether the reported state moved.
    fn influence(
        &self,
        default_change: Option<StateChange>,
        mutate: impl FnOnce(&mut StateData),
    ) {
        let mut data = self.lock();

        let installed_default = data.expected_change.is_none() && default_change.is_some();
        if installed_default {
            data.expected_change = default_change;
        } else if default_change.is_some() {
            debug!("default expected state change is overridden");
        }

        mutate(&mut data);
        self.state_may_have_changed(&mut data);

        if installed_default {
            data.expected_change = None;
        }
    }

    /// Recomputes the reported state; on an edge, updates the history and
    /// emits the change with whatever attribution the expectation gives.
    fn state_may_have_changed(&self, data: &mut StateData) {
        let reported = Self::fused(data);
        if reported == data.current_state {
            return;
        }

        data.last_state = data.current_state;
        data.current_state = reported;
        data.state_history.push_back(reported);
        while data.state_history.len() > STATE_HISTORY_SIZE {
            data.state_history.pop_front();
        }
        debug!(from = %data.last_state, to = %reported, "reported state changed");

        let mut command_id = None;
        let mut source = None;
        let mut reason = None;
        let mut checked = false;

        if Self::is_expected(data) {
            let change = data
                .expected_change
                .as_ref()
                .cloned()
                .unwrap_or_default();
            command_id = change.command_id;
            source = Self::expected_source(data, &change);
            reason = change.reason;
            checked = change.checked;
        } else {
            debug!("unexpected state change");
        }
        data.expected_change = None;

        let event = StateChangedEvent {
            from: data.last_state,
            to: data.current_state,
            command_id,
            source,
            reason,
            checked,
        };

        self.pre_state_change_signal.send(&event.command_id);
        self.state_changed_signal.send(&event);
        self.post_state_change_signal.send(&());
    }

    fn is_expected(data: &StateData) -> bool {
        let Some(change) = &data.expected_change else {
            return false;
        };
        change.to_states.contains_key(&data.current_state)
            || change.from_states.contains_key(&data.last_state)
            || change.default_source.is_some()
    }

    /// Chooses the source: a conflicting pair resolves in favor of the
    /// `from` side, which is what leaving ATTENTION and ERROR needs.
    fn expected_source(data: &StateData, change: &StateChange) -> Option<Source> {
        let source_from = change.from_states.get(&data.last_state).copied();
        let source_to = change.to_states.get(&data.current_state).copied();

        let source = match (source_from, source_to) {
            (Some(from), Some(to)) if from != to => Some(from),
            (Some(from), _) => Some(from),
            (None, Some(to)) => Some(to),
            (None, None) => None,
        };
        source.or(change.default_source)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateData> {
        self.inner.lock().expect("state manager data poisoned")
    }
}
