//! # Value Refresh Engine
//!
//! Monitors and refreshes named observable values. A [`WatchedItem`] owns
//! a gather function, an optional validation function and a write
//! function; the [`ItemUpdater`] keeps every item fresh:
//!
//! - items can refresh on demand or on a periodic interval,
//! - an item that stays invalid past its timeout announces that,
//! - gather and validation failures re-arm the refresh on a retry
//!   interval and the item stays invalid until a gather succeeds.
//!
//! Three workers cooperate: the refresher drains the refresh queue, the
//! invalidator and the timeout watcher each drain a deadline heap. A
//! popped deadline fires only while it still matches the item's record,
//! so cancelled and replaced timers discard themselves.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use printer_protocol::ON_FAIL_INTERVAL;

use crate::signal::Signal;

/// Dynamic value type of watched items.
pub type Value = serde_json::Value;

type GatherFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type GatherFn = Arc<dyn Fn() -> GatherFuture + Send + Sync>;
type ValidateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type WriteFn = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum UpdaterError {
    #[error("no interval specified for item {0} and it has no default")]
    NoInterval(String),
    #[error("item {0} is not tracked by this updater")]
    Untracked(String),
    #[error("a watched group needs at least one member")]
    EmptyGroup,
}

/// Signals published by one watched item.
pub struct ItemSignals {
    pub became_valid: Signal<()>,
    pub became_invalid: Signal<()>,
    pub value_changed: Signal<Value>,
    pub timed_out: Signal<()>,
    pub error_refreshing: Signal<()>,
    pub validation_error: Signal<()>,
    /// Combined gather error / validation error / timeout signal.
    pub val_err_timeout: Signal<()>,
}

struct ItemRecord {
    value: Option<Value>,
    valid: bool,
    scheduled: bool,
    invalidate_at: Option<Instant>,
    times_out_at: Option<Instant>,
}

/// A named observable value with gather, validation and write functions
/// and independent timers.
pub struct WatchedItem {
    name: String,
    gather: GatherFn,
    validate: Option<ValidateFn>,
    write: WriteFn,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    on_fail_interval: Option<Duration>,
    record: Mutex<ItemRecord>,
    pub signals: ItemSignals,
}

impl WatchedItem {
    pub fn new<F, Fut, W>(name: impl Into<String>, gather: F, write: W) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
        W: Fn(&Value) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            gather: Arc::new(move || Box::pin(gather()) as GatherFuture),
            validate: None,
            write: Arc::new(write),
            interval: None,
            timeout: None,
            on_fail_interval: Some(ON_FAIL_INTERVAL),
            record: Mutex::new(ItemRecord {
                value: None,
                valid: false,
                scheduled: false,
                invalidate_at: None,
                times_out_at: None,
            }),
            signals: ItemSignals {
                became_valid: Signal::new(),
                became_invalid: Signal::new(),
                value_changed: Signal::new(),
                timed_out: Signal::new(),
                error_refreshing: Signal::new(),
                validation_error: Signal::new(),
                val_err_timeout: Signal::new(),
            },
        }
    }

    /// Invalidate (and so re-gather) this often.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Announce when the item stays invalid this long.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_validation(
        mut self,
        validate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Retry interval after a failed gather or validation; `None`
    /// disables the automatic retry.
    pub fn with_on_fail_interval(mut self, interval: Option<Duration>) -> Self {
        self.on_fail_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }

    pub fn value(&self) -> Option<Value> {
        self.lock().value.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ItemRecord> {
        self.record.lock().expect("watched item record poisoned")
    }
}

struct TimerEntry {
    at: Instant,
    item: Arc<WatchedItem>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

/// Per-value refresh, timeout and validation scheduler.
pub struct ItemUpdater {
    items: Mutex<HashMap<String, Arc<WatchedItem>>>,
    refresh_tx: mpsc::UnboundedSender<Arc<WatchedItem>>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<WatchedItem>>>>,
    invalidate_timers: Mutex<BinaryHeap<std::cmp::Reverse<TimerEntry>>>,
    invalidate_wake: Notify,
    timeout_timers: Mutex<BinaryHeap<std::cmp::Reverse<TimerEntry>>>,
    timeout_wake: Notify,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ItemUpdater {
    pub fn new() -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(true);
        Arc::new(Self {
            items: Mutex::new(HashMap::new()),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            invalidate_timers: Mutex::new(BinaryHeap::new()),
            invalidate_wake: Notify::new(),
            timeout_timers: Mutex::new(BinaryHeap::new()),
            timeout_wake: Notify::new(),
            running_tx,
            running_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the three governing workers.
    pub fn start(self: &Arc<Self>) {
        let refresher = {
            let updater = Arc::clone(self);
            let receiver = updater
                .refresh_rx
                .lock()
                .expect("refresh receiver poisoned")
                .take();
            tokio::spawn(async move {
                if let Some(receiver) = receiver {
                    updater.refresher(receiver).await;
                }
            })
        };
        let invalidator = {
            let updater = Arc::clone(self);
            tokio::spawn(async move { updater.drive_invalidations().await })
        };
        let timeouts = {
            let updater = Arc::clone(self);
            tokio::spawn(async move { updater.drive_timeouts().await })
        };
        self.tasks
            .lock()
            .expect("updater task list poisoned")
            .extend([refresher, invalidator, timeouts]);
    }

    /// Stops the workers and joins them. Idempotent.
    pub async fn stop(&self) {
        let _ = self.running_tx.send(false);
        self.invalidate_wake.notify_one();
        self.timeout_wake.notify_one();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("updater task list poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Tracks a new item and immediately invalidates it so the first
    /// gather runs.
    pub fn add_watched_item(&self, item: Arc<WatchedItem>) {
        self.items
            .lock()
            .expect("item registry poisoned")
            .insert(item.name().to_string(), Arc::clone(&item));
        self.invalidate(&item);
    }

    pub fn get_watched_item(&self, name: &str) -> Option<Arc<WatchedItem>> {
        self.items
            .lock()
            .expect("item registry poisoned")
            .get(name)
            .cloned()
    }

    /// Invalidates every member of a group.
    pub fn invalidate_group(&self, group: &WatchedGroup) {
        for member in group.members() {
            self.invalidate(member);
        }
    }

    /// Marks the item invalid and queues it for a refresh.
    ///
    /// Repeated calls collapse: the first invalidation matters, and an
    /// already invalid item is only enqueued when no refresh is pending.
    pub fn invalidate(&self, item: &Arc<WatchedItem>) {
        let became_invalid = {
            let mut record = item.lock();
            record.invalidate_at = None;
            let was_valid = record.valid;
            record.valid = false;
            was_valid
        };
        debug!(item = item.name(), "invalidated");
        if became_invalid {
            item.signals.became_invalid.send(&());
        }
        self.enqueue_refresh(item);
    }

    /// Validates and writes a value, re-arming the periodic invalidation.
    ///
    /// Also the entry point for spontaneously reported values, which can
    /// re-enable polling when an auto-report stops.
    pub fn set_value(&self, item: &Arc<WatchedItem>, value: Value) {
        let valid = match &item.validate {
            Some(validate) => validate(&value),
            None => true,
        };
        if !valid {
            warn!(item = item.name(), %value, "validation rejected the gathered value");
            item.signals.validation_error.send(&());
            item.signals.val_err_timeout.send(&());
            self.reschedule_after_failure(item);
            return;
        }
        self.write_value(item, value);
    }

    /// Schedules a future invalidation.
    ///
    /// An already scheduled invalidation is left alone unless `force` is
    /// set. Without an explicit interval the item's own one is used;
    /// having neither is an error.
    pub fn schedule_invalidation(
        &self,
        item: &Arc<WatchedItem>,
        interval: Option<Duration>,
        force: bool,
    ) -> Result<(), UpdaterError> {
        let at = {
            let mut record = item.lock();
            if record.invalidate_at.is_some() && !force {
                debug!(item = item.name(), "an invalidation is already scheduled");
                return Ok(());
            }
            let interval = interval
                .or(item.interval)
                .ok_or_else(|| UpdaterError::NoInterval(item.name().to_string()))?;
            let at = Instant::now() + interval;
            record.invalidate_at = Some(at);
            at
        };
        self.invalidate_timers
            .lock()
            .expect("invalidation timers poisoned")
            .push(std::cmp::Reverse(TimerEntry {
                at,
                item: Arc::clone(item),
            }));
        self.invalidate_wake.notify_one();
        Ok(())
    }

    /// The heap entry itself cannot be removed; clearing the stored
    /// deadline makes the timer discard itself when it fires.
    pub fn cancel_scheduled_invalidation(&self, item: &Arc<WatchedItem>) {
        debug!(item = item.name(), "cancelling the scheduled invalidation");
        item.lock().invalidate_at = None;
    }

    // -- Internals --

    fn enqueue_refresh(&self, item: &Arc<WatchedItem>) {
        let timeout_at = {
            let mut record = item.lock();
            if record.scheduled {
                return;
            }
            record.scheduled = true;

            // The timeout keeps running across failed gathers: it bounds
            // how long the item stays invalid, not a single attempt.
            match (item.timeout, record.times_out_at) {
                (Some(timeout), None) => {
                    let at = Instant::now() + timeout;
                    record.times_out_at = Some(at);
                    Some(at)
                }
                _ => None,
            }
        };

        if let Some(at) = timeout_at {
            self.timeout_timers
                .lock()
                .expect("timeout timers poisoned")
                .push(std::cmp::Reverse(TimerEntry {
                    at,
                    item: Arc::clone(item),
                }));
            self.timeout_wake.notify_one();
        }

        let _ = self.refresh_tx.send(Arc::clone(item));
    }

    fn reschedule_after_failure(&self, item: &Arc<WatchedItem>) {
        if let Some(interval) = item.on_fail_interval {
            debug!(item = item.name(), ?interval, "rescheduling after a failure");
            if let Err(err) = self.schedule_invalidation(item, Some(interval), false) {
                warn!(%err, "could not reschedule a failed item");
            }
        }
    }

    fn write_value(&self, item: &Arc<WatchedItem>, value: Value) {
        let (changed, was_invalid) = {
            let mut record = item.lock();
            let changed = record.value.as_ref() != Some(&value);
            record.value = Some(value.clone());
            let was_invalid = !record.valid;
            record.valid = true;
            record.times_out_at = None;
            (changed, was_invalid)
        };
        if changed {
            debug!(item = item.name(), %value, "item got a new value");
        }

        // Callbacks run with the record lock released, so a write function
        // may call back into the updater for its own item.
        (item.write)(&value);
        if item.interval.is_some() {
            if let Err(err) = self.schedule_invalidation(item, None, true) {
                warn!(%err, "could not arm the periodic invalidation");
            }
        }
        if was_invalid {
            item.signals.became_valid.send(&());
        }
        if changed {
            item.signals.value_changed.send(&value);
        }
    }

    async fn refresher(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Arc<WatchedItem>>) {
        let mut running = self.running_rx.clone();
        loop {
            let item = tokio::select! {
                item = receiver.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
                _ = running.changed() => {
                    if !*running.borrow() {
                        return;
                    }
                    continue;
                }
            };

            {
                let mut record = item.lock();
                record.scheduled = false;
                if record.valid {
                    continue;
                }
            }

            debug!(item = item.name(), "gathering a new value");
            match (item.gather)().await {
                Ok(value) => self.set_value(&item, value),
                Err(err) => {
                    warn!(item = item.name(), %err, "gather failed");
                    item.signals.error_refreshing.send(&());
                    item.signals.val_err_timeout.send(&());
                    self.reschedule_after_failure(&item);
                }
            }
        }
    }

    async fn drive_invalidations(self: Arc<Self>) {
        let updater = Arc::clone(&self);
        self.drive_timers(
            &self.invalidate_timers,
            &self.invalidate_wake,
            |record| record.invalidate_at,
            move |item| updater.invalidate(item),
        )
        .await;
    }

    async fn drive_timeouts(self: Arc<Self>) {
        self.drive_timers(
            &self.timeout_timers,
            &self.timeout_wake,
            |record| record.times_out_at,
            |item| {
                warn!(item = item.name(), "timed out while invalid");
                item.lock().times_out_at = None;
                item.signals.timed_out.send(&());
                item.signals.val_err_timeout.send(&());
            },
        )
        .await;
    }

    /// Shared skeleton of the invalidator and the timeout watcher: sleep
    /// until the earliest deadline, fire it if it still matches the
    /// item's record, discard it otherwise.
    async fn drive_timers(
        &self,
        timers: &Mutex<BinaryHeap<std::cmp::Reverse<TimerEntry>>>,
        wake: &Notify,
        deadline_of: impl Fn(&ItemRecord) -> Option<Instant>,
        fire: impl Fn(&Arc<WatchedItem>),
    ) {
        let mut running = self.running_rx.clone();
        loop {
            if !*running.borrow() {
                return;
            }

            let entry = timers.lock().expect("timer heap poisoned").pop();
            let Some(std::cmp::Reverse(entry)) = entry else {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = running.changed() => {}
                }
                continue;
            };

            // Only a deadline that still matches the record is real.
            if deadline_of(&entry.item.lock()) != Some(entry.at) {
                continue;
            }

            if entry.at > Instant::now() {
                let at = entry.at;
                timers
                    .lock()
                    .expect("timer heap poisoned")
                    .push(std::cmp::Reverse(entry));
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = wake.notified() => {}
                    _ = running.changed() => {}
                }
            } else {
                fire(&entry.item);
            }
        }
    }
}

/// A set of items that is valid only while every member is valid.
pub struct WatchedGroup {
    members: Vec<Arc<WatchedItem>>,
    state: Mutex<GroupState>,
    pub became_valid: Signal<()>,
    pub became_invalid: Signal<()>,
    subscriptions: Mutex<Vec<(Arc<WatchedItem>, crate::signal::HandlerToken, bool)>>,
}

struct GroupState {
    invalid: HashSet<String>,
    valid: bool,
}

impl WatchedGroup {
    pub fn new(members: Vec<Arc<WatchedItem>>) -> Result<Arc<Self>, UpdaterError> {
        if members.is_empty() {
            return Err(UpdaterError::EmptyGroup);
        }

        let invalid: HashSet<String> = members
            .iter()
            .filter(|member| !member.is_valid())
            .map(|member| member.name().to_string())
            .collect();
        let valid = invalid.is_empty();

        let group = Arc::new(Self {
            members: members.clone(),
            state: Mutex::new(GroupState { invalid, valid }),
            became_valid: Signal::new(),
            became_invalid: Signal::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut subscriptions = group
            .subscriptions
            .lock()
            .expect("group subscriptions poisoned");
        for member in &members {
            let name = member.name().to_string();
            let weak = Arc::downgrade(&group);
            let valid_token = member.signals.became_valid.connect(move |_| {
                if let Some(group) = weak.upgrade() {
                    group.member_became_valid(&name);
                }
            });
            subscriptions.push((Arc::clone(member), valid_token, true));

            let name = member.name().to_string();
            let weak = Arc::downgrade(&group);
            let invalid_token = member.signals.became_invalid.connect(move |_| {
                if let Some(group) = weak.upgrade() {
                    group.member_became_invalid(&name);
                }
            });
            subscriptions.push((Arc::clone(member), invalid_token, false));
        }
        drop(subscriptions);

        Ok(group)
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().expect("group state poisoned").valid
    }

    pub fn members(&self) -> &[Arc<WatchedItem>] {
        &self.members
    }

    /// Unsubscribes from every member; part of teardown.
    pub fn detach(&self) {
        let subscriptions: Vec<(Arc<WatchedItem>, crate::signal::HandlerToken, bool)> = self
            .subscriptions
            .lock()
            .expect("group subscriptions poisoned")
            .drain(..)
            .collect();
        for (member, token, was_valid_signal) in subscriptions {
            let signal = if was_valid_signal {
                &member.signals.became_valid
            } else {
                &member.signals.became_invalid
            };
            signal.disconnect(token);
        }
    }

    fn member_became_valid(&self, name: &str) {
        let emits = {
            let mut state = self.state.lock().expect("group state poisoned");
            state.invalid.remove(name);
            if !state.valid && state.invalid.is_empty() {
                state.valid = true;
                true
            } else {
                false
            }
        };
        if emits {
            self.became_valid.send(&());
        }
    }

    fn member_became_invalid(&self, name: &str) {
        let emits = {
            let mut state = self.state.lock().expect("group state poisoned");
            state.invalid.insert(name.to_string());
            if state.valid {
                state.valid = false;
                true
            } else {
                false
            }
        };
        if emits {
            self.became_invalid.send(&());
        }
    }
}
