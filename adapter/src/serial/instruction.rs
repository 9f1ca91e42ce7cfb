//! One outbound G-code line with confirmation state.
//!
//! An [`Instruction`] travels through the serial queue exactly once: it is
//! enqueued, assigned a sequence number, transmitted, and then fed every
//! inbound line until its confirmation requirement is met. Once confirmed
//! (or abandoned because the queue stopped) the instruction is terminal
//! and its flags are frozen.

use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::Notify;
use tracing::warn;

use printer_protocol::OK_REGEX;

/// Begin / item / end patterns of a multi-line collecting instruction.
///
/// Lines matching `begin` open the capture window, lines matching `item`
/// are appended to the captured payload, and a line matching `end` closes
/// the window; the normal confirmation follows after that.
#[derive(Clone, Copy)]
pub struct CapturePattern {
    pub begin: &'static Regex,
    pub item: &'static Regex,
    pub end: &'static Regex,
}

/// What the instruction requires before it counts as confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    /// The first `ok` line confirms.
    FirstOk,
    /// The completion regex alone confirms; no `ok` is expected.
    MatchOnly,
    /// The response regex must match first, then an `ok` confirms.
    MatchThenOk,
}

#[derive(Default)]
struct InstructionState {
    sequence: Option<u32>,
    sent: bool,
    confirmed: bool,
    abandoned: bool,
    matched_line: Option<String>,
    capturing: bool,
    capture_done: bool,
    captured: Vec<String>,
}

/// A single outbound unit with confirmation, capture and match state.
pub struct Instruction {
    gcode: String,
    confirmation: Confirmation,
    match_regex: Option<&'static Regex>,
    capture: Option<CapturePattern>,
    inner: Mutex<InstructionState>,
    done: Notify,
}

impl Instruction {
    /// A plain instruction, confirmed by the first `ok`.
    pub fn plain(gcode: impl Into<String>) -> Arc<Self> {
        Self::build(gcode, Confirmation::FirstOk, None, None)
    }

    /// Confirmed by `ok`; a line matching `regex` is recorded on the way.
    ///
    /// Used both for responses that matter (`M23` open results) and for
    /// rejection patterns whose presence marks the instruction as refused.
    pub fn matchable(gcode: impl Into<String>, regex: &'static Regex) -> Arc<Self> {
        Self::build(gcode, Confirmation::FirstOk, Some(regex), None)
    }

    /// Confirmed by the completion regex alone.
    pub fn match_confirmed(gcode: impl Into<String>, regex: &'static Regex) -> Arc<Self> {
        Self::build(gcode, Confirmation::MatchOnly, Some(regex), None)
    }

    /// Requires the response regex, then an additional `ok` to confirm.
    pub fn response_then_ok(gcode: impl Into<String>, regex: &'static Regex) -> Arc<Self> {
        Self::build(gcode, Confirmation::MatchThenOk, Some(regex), None)
    }

    /// A collecting instruction gathering a multi-line result.
    pub fn collecting(gcode: impl Into<String>, capture: CapturePattern) -> Arc<Self> {
        Self::build(gcode, Confirmation::FirstOk, None, Some(capture))
    }

    fn build(
        gcode: impl Into<String>,
        confirmation: Confirmation,
        match_regex: Option<&'static Regex>,
        capture: Option<CapturePattern>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gcode: gcode.into(),
            confirmation,
            match_regex,
            capture,
            inner: Mutex::new(InstructionState::default()),
            done: Notify::new(),
        })
    }

    pub fn gcode(&self) -> &str {
        &self.gcode
    }

    /// True when the trailing `ok` must be preceded by the response regex.
    pub fn needs_two_oks(&self) -> bool {
        self.confirmation == Confirmation::MatchThenOk
    }

    pub fn sequence(&self) -> Option<u32> {
        self.lock().sequence
    }

    pub fn is_sent(&self) -> bool {
        self.lock().sent
    }

    pub fn is_confirmed(&self) -> bool {
        self.lock().confirmed
    }

    /// The line that satisfied the attached regex, if one was seen.
    pub fn matched_line(&self) -> Option<String> {
        self.lock().matched_line.clone()
    }

    /// Re-applies the attached regex to the matched line and returns the
    /// named group, when both exist.
    pub fn match_group(&self, group: &str) -> Option<String> {
        let line = self.matched_line()?;
        let captures = self.match_regex?.captures(&line)?;
        captures.name(group).map(|m| m.as_str().to_string())
    }

    /// The captured payload of a collecting instruction, in arrival order.
    pub fn captured(&self) -> Vec<String> {
        self.lock().captured.clone()
    }

    /// Blocks until the instruction is confirmed or abandoned.
    ///
    /// Returns true when confirmed.
    pub async fn wait(&self) -> bool {
        loop {
            let notified = self.done.notified();
            {
                let state = self.lock();
                if state.confirmed {
                    return true;
                }
                if state.abandoned {
                    return false;
                }
            }
            notified.await;
        }
    }

    // -- Queue internals --

    pub(crate) fn mark_sent(&self, sequence: u32) {
        let mut state = self.lock();
        if state.confirmed || state.abandoned {
            warn!(gcode = %self.gcode, "marking a terminal instruction as sent");
            return;
        }
        state.sent = true;
        state.sequence = Some(sequence);
    }

    /// Feeds one inbound line; returns true when the instruction became
    /// confirmed by it.
    pub(crate) fn process_line(&self, line: &str) -> bool {
        let mut state = self.lock();
        if state.confirmed || state.abandoned || !state.sent {
            return false;
        }

        if let Some(capture) = &self.capture {
            if !state.capture_done {
                if state.capturing {
                    if capture.end.is_match(line) {
                        state.capturing = false;
                        state.capture_done = true;
                        return false;
                    }
                    if capture.item.is_match(line) {
                        state.captured.push(line.to_string());
                        return false;
                    }
                } else if capture.begin.is_match(line) {
                    state.capturing = true;
                    return false;
                }
            }
        }

        let is_ok = OK_REGEX.is_match(line);
        match self.confirmation {
            Confirmation::FirstOk => {
                if is_ok {
                    return self.confirm(&mut state);
                }
                if let Some(regex) = self.match_regex {
                    if state.matched_line.is_none() && regex.is_match(line) {
                        state.matched_line = Some(line.to_string());
                    }
                }
                false
            }
            Confirmation::MatchOnly => {
                let regex = self.match_regex.expect("match-confirmed without regex");
                if regex.is_match(line) {
                    state.matched_line = Some(line.to_string());
                    return self.confirm(&mut state);
                }
                false
            }
            Confirmation::MatchThenOk => {
                if state.matched_line.is_none() {
                    let regex = self.match_regex.expect("two-ok instruction without regex");
                    if regex.is_match(line) {
                        state.matched_line = Some(line.to_string());
                    }
                    false
                } else if is_ok {
                    self.confirm(&mut state)
                } else {
                    false
                }
            }
        }
    }

    /// Releases waiters without confirming; used when the queue stops or
    /// the instruction stalls.
    pub(crate) fn abandon(&self) {
        let mut state = self.lock();
        if state.confirmed || state.abandoned {
            return;
        }
        state.abandoned = true;
        drop(state);
        self.done.notify_waiters();
    }

    fn confirm(&self, state: &mut InstructionState) -> bool {
        state.confirmed = true;
        self.done.notify_waiters();
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InstructionState> {
        self.inner.lock().expect("instruction state poisoned")
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Instruction")
            .field("gcode", &self.gcode)
            .field("sequence", &state.sequence)
            .field("sent", &state.sent)
            .field("confirmed", &state.confirmed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printer_protocol::{
        BEGIN_FILES_REGEX, END_FILES_REGEX, FILE_PATH_REGEX, OPEN_RESULT_REGEX,
    };

    #[test]
    fn test_cannot_confirm_before_sent() {
        let instruction = Instruction::plain("M115");
        assert!(!instruction.process_line("ok"));
        assert!(!instruction.is_confirmed());

        instruction.mark_sent(1);
        assert!(!instruction.process_line("FIRMWARE_NAME:Marlin 2.1.2"));
        assert!(instruction.process_line("ok"));
        assert!(instruction.is_confirmed());
        assert!(instruction.captured().is_empty());
    }

    #[test]
    fn test_flags_frozen_after_confirmation() {
        let instruction = Instruction::plain("G28");
        instruction.mark_sent(2);
        assert!(instruction.process_line("ok"));
        assert!(!instruction.process_line("ok"), "terminal instructions ignore lines");
        assert_eq!(instruction.sequence(), Some(2));
    }

    #[test]
    fn test_matchable_records_response_before_ok() {
        let instruction = Instruction::matchable("M23 /test.gco", &OPEN_RESULT_REGEX);
        instruction.mark_sent(5);
        assert!(!instruction.process_line("Now fresh file: test.gco"));
        assert!(instruction.process_line("ok"));
        assert!(instruction.match_group("ok").is_some());
    }

    #[test]
    fn test_two_oks_requires_response_first() {
        let instruction = Instruction::response_then_ok("M23 /a.gco", &OPEN_RESULT_REGEX);
        instruction.mark_sent(3);
        assert!(!instruction.process_line("ok"), "ok before the response must not confirm");
        assert!(!instruction.is_confirmed());
        assert!(!instruction.process_line("Now fresh file: a.gco"));
        assert!(instruction.process_line("ok"));
        assert!(instruction.is_confirmed());
    }

    #[test]
    fn test_collecting_capture_window() {
        let instruction = Instruction::collecting(
            "M20",
            CapturePattern {
                begin: &BEGIN_FILES_REGEX,
                item: &FILE_PATH_REGEX,
                end: &END_FILES_REGEX,
            },
        );
        instruction.mark_sent(7);

        instruction.process_line("Begin file list");
        instruction.process_line("BENCHY~1.GCO 154208");
        instruction.process_line("CUBE~1.GCO 1024");
        instruction.process_line("End file list");
        assert!(!instruction.is_confirmed());
        assert!(instruction.process_line("ok"));

        assert_eq!(
            instruction.captured(),
            vec!["BENCHY~1.GCO 154208".to_string(), "CUBE~1.GCO 1024".to_string()]
        );
    }

    #[tokio::test]
    async fn test_abandon_releases_waiters() {
        let instruction = Instruction::plain("M105");
        instruction.mark_sent(1);

        let waiter = {
            let instruction = Arc::clone(&instruction);
            tokio::spawn(async move { instruction.wait().await })
        };
        instruction.abandon();
        assert!(!waiter.await.unwrap());
    }
}
