//! The ordered, confirmation-driven outbound queue.
//!
//! A single dispatch loop serializes every outbound line: pop the next
//! instruction, assign the next sequence number, frame it as
//! `N<seq> <gcode>*<checksum>` and transmit, then wait for the
//! confirmation the instruction requires before touching the next one.
//! Confirmation order is therefore FIFO with respect to issuance.
//!
//! The firmware may request retransmission with `Resend: k`; every framed
//! line is remembered in a bounded history and replayed byte-for-byte,
//! original sequence numbers and checksums included. A request older than
//! the history tail cannot be honored and kills the session.
//!
//! Confirmation latencies feed the [`super::planner_fed::PlannerFeed`]
//! estimator so supervisors can tell whether the printer's planner buffer
//! is kept full.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use printer_protocol::{
    frame_line, parse_resend, HISTORY_LENGTH, MAX_SEQUENCE, RESEND_REGEX, RESERVED_SEQUENCE,
    SERIAL_QUEUE_TIMEOUT,
};

use crate::serial::instruction::{CapturePattern, Instruction};
use crate::serial::link::PortCommand;
use crate::serial::matcher::{LineMatcher, MatchToken};
use crate::serial::planner_fed::PlannerFeed;
use crate::signal::Signal;

static ANY_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.*$").unwrap());

/// An instruction stayed unconfirmed past `SERIAL_QUEUE_TIMEOUT`.
#[derive(Debug, Clone)]
pub struct StallEvent {
    pub gcode: String,
    pub sequence: Option<u32>,
}

/// The firmware requested a sequence number the history no longer holds.
#[derive(Debug, Clone)]
pub struct SessionFatal {
    pub requested: u32,
}

#[derive(Clone)]
struct HistoryEntry {
    sequence: u32,
    framed: String,
}

struct Inner {
    pending: VecDeque<Arc<Instruction>>,
    current: Option<Arc<Instruction>>,
    history: VecDeque<HistoryEntry>,
    resend: VecDeque<HistoryEntry>,
    next_sequence: u32,
    paused: bool,
    stopped: bool,
    sent_at: Option<Instant>,
}

/// Ordered dispatch over the serial link with resend and stall handling.
pub struct SerialQueue {
    inner: Mutex<Inner>,
    wake: Notify,
    port: mpsc::Sender<PortCommand>,
    planner: Mutex<PlannerFeed>,
    confirmed_signal: Signal<Arc<Instruction>>,
    stall_signal: Signal<StallEvent>,
    fatal_signal: Signal<SessionFatal>,
    running: watch::Receiver<bool>,
}

impl SerialQueue {
    pub fn new(port: mpsc::Sender<PortCommand>, running: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                current: None,
                history: VecDeque::new(),
                resend: VecDeque::new(),
                next_sequence: RESERVED_SEQUENCE + 1,
                paused: false,
                stopped: false,
                sent_at: None,
            }),
            wake: Notify::new(),
            port,
            planner: Mutex::new(PlannerFeed::new()),
            confirmed_signal: Signal::new(),
            stall_signal: Signal::new(),
            fatal_signal: Signal::new(),
            running,
        })
    }

    /// Fires once per confirmed instruction, in confirmation order.
    pub fn confirmed_signal(&self) -> &Signal<Arc<Instruction>> {
        &self.confirmed_signal
    }

    /// Fires when an instruction stays unconfirmed past the queue timeout.
    pub fn stall_signal(&self) -> &Signal<StallEvent> {
        &self.stall_signal
    }

    /// Fires when a resend request falls outside the history window.
    pub fn fatal_signal(&self) -> &Signal<SessionFatal> {
        &self.fatal_signal
    }

    /// Registers the queue's inbound handlers on the matcher: resend
    /// requests, and a catch-all feeding the in-flight instruction its
    /// confirmations, matches and captures.
    pub fn attach(self: &Arc<Self>, matcher: &LineMatcher) -> Vec<MatchToken> {
        let mut tokens = Vec::new();

        let resend_queue = Arc::downgrade(self);
        tokens.push(matcher.add_handler(&RESEND_REGEX, move |captures| {
            if let Some(queue) = resend_queue.upgrade() {
                if let Some(whole) = captures.get(0) {
                    queue.handle_resend(whole.as_str());
                }
            }
        }));

        let feed_queue = Arc::downgrade(self);
        tokens.push(matcher.add_handler(&ANY_LINE, move |captures| {
            if let Some(queue) = feed_queue.upgrade() {
                if let Some(whole) = captures.get(0) {
                    queue.feed_line(whole.as_str());
                }
            }
        }));

        tokens
    }

    /// Convenience entry point for tests and direct wiring: routes one
    /// inbound line the same way the matcher handlers would.
    pub fn line_received(&self, line: &str) {
        if RESEND_REGEX.is_match(line) {
            self.handle_resend(line);
        } else {
            self.feed_line(line);
        }
    }

    // -- Enqueueing --

    /// Appends (or pushes to the front) and returns immediately.
    pub fn enqueue(&self, instruction: Arc<Instruction>, to_front: bool) {
        {
            let mut inner = self.lock();
            if inner.stopped {
                drop(inner);
                instruction.abandon();
                return;
            }
            if to_front {
                inner.pending.push_front(instruction);
            } else {
                inner.pending.push_back(instruction);
            }
        }
        self.wake.notify_one();
    }

    pub fn enqueue_plain(&self, gcode: impl Into<String>, to_front: bool) -> Arc<Instruction> {
        let instruction = Instruction::plain(gcode);
        self.enqueue(Arc::clone(&instruction), to_front);
        instruction
    }

    pub fn enqueue_matchable(
        &self,
        gcode: impl Into<String>,
        regex: &'static Regex,
        to_front: bool,
    ) -> Arc<Instruction> {
        let instruction = Instruction::matchable(gcode, regex);
        self.enqueue(Arc::clone(&instruction), to_front);
        instruction
    }

    pub fn enqueue_collecting(
        &self,
        gcode: impl Into<String>,
        capture: CapturePattern,
    ) -> Arc<Instruction> {
        let instruction = Instruction::collecting(gcode, capture);
        self.enqueue(Arc::clone(&instruction), false);
        instruction
    }

    /// Enqueues a batch at the front, preserving the given order.
    pub fn enqueue_list(
        &self,
        gcodes: impl IntoIterator<Item = String>,
        regex: &'static Regex,
    ) -> Vec<Arc<Instruction>> {
        let instructions: Vec<Arc<Instruction>> = gcodes
            .into_iter()
            .map(|gcode| Instruction::matchable(gcode, regex))
            .collect();
        {
            let mut inner = self.lock();
            if inner.stopped {
                drop(inner);
                for instruction in &instructions {
                    instruction.abandon();
                }
                return instructions;
            }
            for instruction in instructions.iter().rev() {
                inner.pending.push_front(Arc::clone(instruction));
            }
        }
        self.wake.notify_one();
        instructions
    }

    // -- Flow control --

    /// Suspends new dispatch; the in-flight instruction still confirms.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Stops the queue and releases every waiter. Idempotent.
    pub fn stop(&self) {
        let abandoned: Vec<Arc<Instruction>> = {
            let mut inner = self.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            let mut doomed: Vec<Arc<Instruction>> = inner.pending.drain(..).collect();
            if let Some(current) = inner.current.take() {
                doomed.push(current);
            }
            doomed
        };
        for instruction in abandoned {
            instruction.abandon();
        }
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Whether recent confirmation latency says the planner buffer is
    /// being fed fast enough.
    pub fn is_planner_fed(&self) -> bool {
        self.planner.lock().expect("planner feed poisoned").is_fed()
    }

    // -- Dispatch loop --

    /// The writer: runs until the queue stops or shutdown flips.
    pub async fn run(self: Arc<Self>) {
        let mut running = self.running.clone();

        // Reset the firmware's line counter so numbering starts clean.
        // The reset is a real in-flight instruction: its confirmation must
        // not leak onto whatever gets dispatched next.
        let reset = Instruction::plain("M110 N0");
        let framed = {
            let mut inner = self.lock();
            let framed = frame_line(RESERVED_SEQUENCE, reset.gcode());
            inner.history.push_back(HistoryEntry {
                sequence: RESERVED_SEQUENCE,
                framed: framed.clone(),
            });
            reset.mark_sent(RESERVED_SEQUENCE);
            inner.current = Some(Arc::clone(&reset));
            inner.sent_at = Some(Instant::now());
            framed
        };
        if self
            .port
            .send(PortCommand::Write(framed.into_bytes()))
            .await
            .is_err()
        {
            warn!("port pump gone before the session started");
            self.stop();
            return;
        }
        if !self.await_confirmation(&reset, &mut running).await {
            return;
        }

        loop {
            // Wait until there is work: retransmissions, an in-flight
            // confirmation, or a dispatchable instruction.
            loop {
                {
                    let inner = self.lock();
                    if inner.stopped {
                        break;
                    }
                    if !inner.resend.is_empty()
                        || inner.current.is_some()
                        || (!inner.paused && !inner.pending.is_empty())
                    {
                        break;
                    }
                }
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = running.changed() => {
                        if !*running.borrow() {
                            self.stop();
                        }
                    }
                }
            }
            if self.lock().stopped {
                self.stop();
                return;
            }

            if !self.flush_resends().await {
                return;
            }

            let in_flight = self.lock().current.clone();
            if let Some(instruction) = in_flight {
                if !self.await_confirmation(&instruction, &mut running).await {
                    return;
                }
                continue;
            }

            // Dispatch the next pending instruction.
            let Some((instruction, framed)) = self.prepare_next() else {
                continue;
            };
            if self
                .port
                .send(PortCommand::Write(framed.into_bytes()))
                .await
                .is_err()
            {
                warn!("port pump gone, stopping the serial queue");
                self.stop();
                return;
            }
            if !self.await_confirmation(&instruction, &mut running).await {
                return;
            }
        }
    }

    /// Pops the next instruction and frames it; updates history and the
    /// in-flight slot.
    fn prepare_next(&self) -> Option<(Arc<Instruction>, String)> {
        let mut inner = self.lock();
        if inner.stopped || inner.paused {
            return None;
        }
        let instruction = inner.pending.pop_front()?;

        let sequence = inner.next_sequence;
        let mut next = if sequence >= MAX_SEQUENCE { 0 } else { sequence + 1 };
        if next == RESERVED_SEQUENCE {
            next += 1;
        }
        inner.next_sequence = next;

        let framed = frame_line(sequence, instruction.gcode());
        inner.history.push_back(HistoryEntry {
            sequence,
            framed: framed.clone(),
        });
        while inner.history.len() > HISTORY_LENGTH {
            inner.history.pop_front();
        }

        instruction.mark_sent(sequence);
        inner.current = Some(Arc::clone(&instruction));
        inner.sent_at = Some(Instant::now());
        Some((instruction, framed))
    }

    /// Retransmits any frames queued by a resend request, in order.
    /// Returns false when the port is gone.
    async fn flush_resends(&self) -> bool {
        let frames: Vec<HistoryEntry> = {
            let mut inner = self.lock();
            inner.resend.drain(..).collect()
        };
        if frames.is_empty() {
            return true;
        }
        debug!(
            first = frames.first().map(|entry| entry.sequence),
            count = frames.len(),
            "replaying history for a resend request"
        );
        for entry in frames {
            if self
                .port
                .send(PortCommand::Write(entry.framed.into_bytes()))
                .await
                .is_err()
            {
                warn!("port pump gone during a resend replay");
                self.stop();
                return false;
            }
        }
        self.lock().sent_at = Some(Instant::now());
        true
    }

    /// Waits out one instruction: confirmation, retransmission wakeups,
    /// stall timeout or shutdown. Returns false when the loop must exit.
    async fn await_confirmation(
        &self,
        instruction: &Arc<Instruction>,
        running: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let deadline = self
                .lock()
                .sent_at
                .map(|at| at + SERIAL_QUEUE_TIMEOUT)
                .unwrap_or_else(|| Instant::now() + SERIAL_QUEUE_TIMEOUT);

            tokio::select! {
                _ = instruction.wait() => {
                    return true;
                }
                _ = self.wake.notified() => {
                    if self.lock().stopped {
                        self.stop();
                        return false;
                    }
                    if !self.flush_resends().await {
                        return false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        gcode = instruction.gcode(),
                        sequence = instruction.sequence(),
                        "no confirmation within the queue timeout, reporting a stall"
                    );
                    instruction.abandon();
                    {
                        let mut inner = self.lock();
                        if inner
                            .current
                            .as_ref()
                            .is_some_and(|current| Arc::ptr_eq(current, instruction))
                        {
                            inner.current = None;
                            inner.sent_at = None;
                        }
                    }
                    self.stall_signal.send(&StallEvent {
                        gcode: instruction.gcode().to_string(),
                        sequence: instruction.sequence(),
                    });
                    return true;
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        self.stop();
                        return false;
                    }
                }
            }
        }
    }

    // -- Inbound --

    fn feed_line(&self, line: &str) {
        let current = self.lock().current.clone();
        let Some(instruction) = current else {
            return;
        };
        if !instruction.process_line(line) {
            return;
        }

        let latency = {
            let mut inner = self.lock();
            let latency = inner.sent_at.take().map(|at| at.elapsed());
            if inner
                .current
                .as_ref()
                .is_some_and(|slot| Arc::ptr_eq(slot, &instruction))
            {
                inner.current = None;
            }
            latency
        };
        if let Some(latency) = latency {
            self.planner
                .lock()
                .expect("planner feed poisoned")
                .add_sample(latency);
        }
        self.confirmed_signal.send(&instruction);
        self.wake.notify_one();
    }

    fn handle_resend(&self, line: &str) {
        let requested = match parse_resend(line) {
            Ok(number) => number,
            Err(err) => {
                warn!(%err, "ignoring malformed resend request");
                return;
            }
        };

        let in_window = {
            let mut inner = self.lock();
            if inner.stopped {
                return;
            }
            match inner
                .history
                .iter()
                .position(|entry| entry.sequence == requested)
            {
                Some(position) => {
                    let tail: VecDeque<HistoryEntry> =
                        inner.history.iter().skip(position).cloned().collect();
                    inner.resend = tail;
                    true
                }
                None => false,
            }
        };

        if in_window {
            self.wake.notify_one();
        } else {
            error!(
                requested,
                "resend request is older than the history window, session is lost"
            );
            self.fatal_signal.send(&SessionFatal { requested });
            self.stop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("serial queue state poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printer_protocol::{BEGIN_FILES_REGEX, END_FILES_REGEX, FILE_PATH_REGEX, OPEN_RESULT_REGEX};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Rig {
        queue: Arc<SerialQueue>,
        port_rx: mpsc::Receiver<PortCommand>,
        running_tx: watch::Sender<bool>,
    }

    fn rig() -> Rig {
        let (port_tx, port_rx) = mpsc::channel(64);
        let (running_tx, running_rx) = watch::channel(true);
        let queue = SerialQueue::new(port_tx, running_rx);
        tokio::spawn(Arc::clone(&queue).run());
        Rig {
            queue,
            port_rx,
            running_tx,
        }
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

    /// Consumes and confirms the session's line counter reset.
    async fn open_session(rig: &mut Rig) {
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(0, "M110 N0"));
        rig.queue.line_received("ok");
    }

    #[tokio::test]
    async fn test_session_starts_with_line_counter_reset() {
        let mut rig = rig();
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(0, "M110 N0"));
        rig.running_tx.send(false).unwrap();
    }

    #[tokio::test]
    async fn test_plain_instruction_confirms_on_ok() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let instruction = rig.queue.enqueue_plain("M115", false);
        let frame = next_frame(&mut rig.port_rx).await;
        assert_eq!(frame, frame_line(1, "M115"));

        rig.queue.line_received("FIRMWARE_NAME:Marlin 2.1.2");
        rig.queue.line_received("ok");

        assert!(instruction.wait().await);
        assert!(instruction.is_confirmed());
        assert!(instruction.captured().is_empty());
    }

    #[tokio::test]
    async fn test_matchable_open_result() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let instruction = rig
            .queue
            .enqueue_matchable("M23 /test.gco", &OPEN_RESULT_REGEX, false);
        next_frame(&mut rig.port_rx).await;

        rig.queue.line_received("Now fresh file: test.gco");
        rig.queue.line_received("ok");

        assert!(instruction.wait().await);
        assert!(instruction.match_group("ok").is_some());
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_issued_in_write_order() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let first = rig.queue.enqueue_plain("G28", false);
        let second = rig.queue.enqueue_plain("M105", false);

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "G28"));
        rig.queue.line_received("ok");
        assert!(first.wait().await);

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(2, "M105"));
        rig.queue.line_received("ok");
        assert!(second.wait().await);
    }

    #[tokio::test]
    async fn test_resend_replays_history_from_requested_sequence() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let first = rig.queue.enqueue_plain("G28", false);
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "G28"));
        rig.queue.line_received("ok");
        assert!(first.wait().await);

        let second = rig.queue.enqueue_plain("M105", false);
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(2, "M105"));

        // The firmware lost everything from sequence 1 on.
        rig.queue.line_received("Resend: 1");
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "G28"));
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(2, "M105"));

        rig.queue.line_received("ok");
        assert!(second.wait().await);
    }

    #[tokio::test]
    async fn test_resend_older_than_history_is_fatal() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let fatal_hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fatal_hits);
        rig.queue.fatal_signal().connect(move |event| {
            assert_eq!(event.requested, 999_999);
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let doomed = rig.queue.enqueue_plain("M105", false);
        next_frame(&mut rig.port_rx).await;

        rig.queue.line_received("Resend: 999999");
        assert!(!doomed.wait().await, "waiters must be released on a fatal resend");
        assert!(rig.queue.is_stopped());
        assert_eq!(fatal_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_instruction_stalls_after_timeout() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let stalled = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&stalled);
        rig.queue.stall_signal().connect(move |event| {
            assert_eq!(event.gcode, "M105");
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let instruction = rig.queue.enqueue_plain("M105", false);
        next_frame(&mut rig.port_rx).await;

        // Nothing answers; the queue timeout elapses under paused time.
        assert!(!instruction.wait().await);
        assert_eq!(stalled.load(Ordering::SeqCst), 1);
        assert!(!rig.queue.is_stopped(), "a stall is not fatal to the session");
    }

    #[tokio::test]
    async fn test_pause_holds_dispatch_and_resume_releases_it() {
        let mut rig = rig();
        open_session(&mut rig).await;

        rig.queue.pause();
        let instruction = rig.queue.enqueue_plain("G28", false);

        tokio::task::yield_now().await;
        assert!(
            rig.port_rx.try_recv().is_err(),
            "paused queue must not transmit"
        );
        assert!(!instruction.is_sent());

        rig.queue.resume();
        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "G28"));
    }

    #[tokio::test]
    async fn test_front_enqueue_overtakes_pending_work() {
        let mut rig = rig();
        open_session(&mut rig).await;

        rig.queue.pause();
        rig.queue.enqueue_plain("G28", false);
        rig.queue
            .enqueue_list(vec!["M601".to_string()], &printer_protocol::REJECTION_REGEX);
        rig.queue.resume();

        assert_eq!(next_frame(&mut rig.port_rx).await, frame_line(1, "M601"));
    }

    #[tokio::test]
    async fn test_collecting_instruction_captures_listing() {
        let mut rig = rig();
        open_session(&mut rig).await;

        let instruction = rig.queue.enqueue_collecting(
            "M20",
            CapturePattern {
                begin: &BEGIN_FILES_REGEX,
                item: &FILE_PATH_REGEX,
                end: &END_FILES_REGEX,
            },
        );
        next_frame(&mut rig.port_rx).await;

        for line in [
            "Begin file list",
            "BENCHY~1.GCO 154208",
            "End file list",
            "ok",
        ] {
            rig.queue.line_received(line);
        }

        assert!(instruction.wait().await);
        assert_eq!(instruction.captured(), vec!["BENCHY~1.GCO 154208".to_string()]);
    }

    #[tokio::test]
    async fn test_confirmation_latency_reaches_planner_estimate() {
        let mut rig = rig();
        open_session(&mut rig).await;

        for _ in 0..3 {
            let instruction = rig.queue.enqueue_plain("G1 X1", false);
            next_frame(&mut rig.port_rx).await;
            rig.queue.line_received("ok");
            assert!(instruction.wait().await);
        }
        assert!(rig.queue.is_planner_fed());
    }
}
