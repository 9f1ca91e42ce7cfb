//! # Printer Serial Protocol
//!
//! This library defines the serial wire vocabulary spoken between the print
//! host adapter and the printer's G-code firmware. It provides the reported
//! state model, the recognized inbound line families, outbound line framing,
//! and the tuning constants shared by every adapter component.
//!
//! ## Protocol Architecture
//!
//! The printer side of the link is line oriented, 8-N-1 serial. Outbound
//! lines carry a sequence number and an XOR checksum so the firmware can
//! request retransmission of garbled lines:
//!
//! ```text
//! N3 T0*57\n
//! N4 M105*36\n
//! ```
//!
//! Inbound lines are free-form firmware chatter. The families the adapter
//! reacts to are captured as [`regex::Regex`] statics in this crate so that
//! the adapter, its tests, and any tooling agree on exactly one definition
//! of each token.
//!
//! ## State Model
//!
//! The reported printer state is fused from three layers, most important
//! first: an override layer ([`OverrideState`]), a printing layer
//! ([`PrintingState`]) and a base layer ([`BaseState`]). [`State`] is the
//! flattened union used everywhere a single reported value is needed.

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// Shared Type Definitions

/// Reported printer state, the flattened union of all three state layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Ready,
    Busy,
    Printing,
    Paused,
    Finished,
    Stopped,
    Attention,
    Error,
}

impl State {
    /// Returns true for the states that occupy the printing layer.
    pub fn is_printing_layer(&self) -> bool {
        matches!(
            self,
            State::Printing | State::Paused | State::Finished | State::Stopped
        )
    }

    /// Returns true while a job is actively held by the printer.
    pub fn job_ongoing(&self) -> bool {
        matches!(self, State::Printing | State::Paused)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Ready => "READY",
            State::Busy => "BUSY",
            State::Printing => "PRINTING",
            State::Paused => "PAUSED",
            State::Finished => "FINISHED",
            State::Stopped => "STOPPED",
            State::Attention => "ATTENTION",
            State::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Base state layer, the least important one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseState {
    Ready,
    Busy,
}

/// Printing state layer, wins over the base layer when occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintingState {
    Printing,
    Paused,
    Finished,
    Stopped,
}

/// Override state layer, wins over everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideState {
    Attention,
    Error,
}

impl From<BaseState> for State {
    fn from(value: BaseState) -> Self {
        match value {
            BaseState::Ready => State::Ready,
            BaseState::Busy => State::Busy,
        }
    }
}

impl From<PrintingState> for State {
    fn from(value: PrintingState) -> Self {
        match value {
            PrintingState::Printing => State::Printing,
            PrintingState::Paused => State::Paused,
            PrintingState::Finished => State::Finished,
            PrintingState::Stopped => State::Stopped,
        }
    }
}

impl From<OverrideState> for State {
    fn from(value: OverrideState) -> Self {
        match value {
            OverrideState::Attention => State::Attention,
            OverrideState::Error => State::Error,
        }
    }
}

/// Who or what caused a state transition or issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    /// The cloud control plane.
    Connect,
    /// A human, through any local control surface.
    User,
    /// The printer firmware itself.
    Marlin,
    /// Adapter-internal firmware style decisions (fan error reports).
    Firmware,
    /// The serial link layer.
    Serial,
    /// The local web UI.
    Wui,
    /// Hardware error bookkeeping.
    Hw,
}

// Outbound Framing

/// XOR checksum of an already numbered line, everything before the `*`.
pub fn checksum(line: &str) -> u8 {
    line.bytes().fold(0u8, |acc, byte| acc ^ byte)
}

/// Frames a G-code line for transmission as `N<seq> <gcode>*<checksum>\n`.
pub fn frame_line(sequence: u32, gcode: &str) -> String {
    let numbered = format!("N{sequence} {gcode}");
    let checksum = checksum(&numbered);
    format!("{numbered}*{checksum}\n")
}

/// Error kinds surfaced by wire level parsing.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed resend request: {0}")]
    MalformedResend(String),
}

/// Parses the sequence number out of a `Resend:` line.
pub fn parse_resend(line: &str) -> Result<u32, WireError> {
    let captures = RESEND_REGEX
        .captures(line)
        .ok_or_else(|| WireError::MalformedResend(line.to_string()))?;
    captures["number"]
        .parse()
        .map_err(|_| WireError::MalformedResend(line.to_string()))
}

// Inbound Line Families

/// Confirmation of the oldest unconfirmed numbered line.
pub static OK_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ok(?: .*)?$").unwrap());

/// Firmware requesting retransmission from a given sequence number.
pub static RESEND_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Resend: ?(?P<number>\d+)").unwrap());

/// The banner the firmware prints on every boot.
pub static PRINTER_BOOT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^start$").unwrap());

/// The firmware is busy processing and cannot confirm yet.
pub static BUSY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^echo:busy:\s*processing$").unwrap());

/// The firmware is waiting for the user at the printer.
pub static ATTENTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^echo:busy:\s*paused for user$").unwrap());

/// Print paused marker.
pub static PAUSED_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^// action:paused$").unwrap());

/// Print resumed marker.
pub static RESUMED_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^// action:resumed$").unwrap());

/// Print cancelled marker.
pub static CANCEL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^// action:cancel$").unwrap());

/// The firmware started executing a print.
pub static START_PRINT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^echo:enqueing "M24"$"#).unwrap());

/// The firmware finished printing the selected file.
pub static PRINT_DONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Done printing file$").unwrap());

/// The whole error family with named sub-groups.
///
/// Specific errors carry enough detail to assemble a human readable reason;
/// generic `stopped` / `kill` lines only announce that the firmware halted
/// and the explanation may arrive separately.
pub static ERROR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^Error:\s*(?:
            (?P<temp>
                (?:(?P<mintemp>MINTEMP)|(?P<maxtemp>MAXTEMP))
                (?:.*Heater_ID:\s*(?P<bed>bed).*|.*)
            )
          | (?P<runaway>
                (?:(?P<hotend_runaway>Thermal\ Runaway)
                  |(?P<heatbed_runaway>Heatbed\ Thermal\ Runaway)
                  |(?P<preheat_hotend>Hotend\ Preheat\ error)
                  |(?P<preheat_heatbed>Heatbed\ Preheat\ error)
                ).*
            )
          | (?P<bed_levelling>Bed\ leveling\ failed.*)
          | (?P<kill>Printer\ halted.*)
          | (?P<stop>[Ss]topped.*)
        )$",
    )
    .unwrap()
});

/// Fan failure report, names the fan that stalled.
pub static FAN_ERROR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^E(?P<fan_id>\d+):\s*(?P<fan_name>[A-Za-z][A-Za-z ]*?) fan error$").unwrap()
});

/// SD init result. The `ok` group is present when a card responded.
pub static SD_PRESENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<ok>echo:SD card ok)|(?P<fail>echo:SD init fail))$").unwrap()
});

/// The card was released / physically ejected.
pub static SD_EJECTED_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^echo:SD card released$").unwrap());

/// First line of an SD file listing.
pub static BEGIN_FILES_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Begin file list$").unwrap());

/// Terminating line of an SD file listing.
pub static END_FILES_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^End file list$").unwrap());

/// One 8.3 entry of a plain `M20` listing: short path and byte size.
pub static FILE_PATH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<sfn>\S+)\s+(?P<size>\d+)$").unwrap());

/// One line of an `M20 -L` long-name listing.
///
/// Three shapes share this family: directory entry, file entry with both
/// the 8.3 path and the quoted long name, and directory exit.
pub static LFN_CAPTURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)^(?:
            (?P<dir_enter>DIR_ENTER:\ (?P<dir_sfn>\S+)\ "(?P<dir_lfn>[^"]+)")
          | (?P<file>(?P<sfn>\S+)\ (?P<size>\d+)\ "(?P<lfn>[^"]+)")
          | (?P<dir_exit>DIR_EXIT)
        )$"#,
    )
    .unwrap()
});

/// Result of `M23`, the SD file open command.
pub static OPEN_RESULT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<ok>File opened|Now fresh file):?.*|(?P<failure>open failed).*)$").unwrap()
});

/// The firmware rejecting a command it does not understand.
pub static REJECTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^echo:Unknown command: "?(?P<unknown>[^"]*)"?$"#).unwrap());

// Module-level Constants

/// Granularity of every cancellable wait, bounds shutdown latency.
pub const QUIT_INTERVAL: Duration = Duration::from_millis(200);

/// How long the printer takes to boot after a reset.
pub const PRINTER_BOOT_WAIT: Duration = Duration::from_secs(8);

/// How long a commanded state transition may take before it fails.
pub const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long an instruction may stay unconfirmed before the queue stalls.
pub const SERIAL_QUEUE_TIMEOUT: Duration = Duration::from_secs(25);

/// How long to wait for an explanation after a generic firmware halt.
pub const ERROR_REASON_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on a full adapter teardown.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(15);

/// How many sent instructions to remember for resend requests.
pub const HISTORY_LENGTH: usize = 30;

/// How many reported states to keep in the state history.
pub const STATE_HISTORY_SIZE: usize = 10;

/// Largest sequence number; the next one wraps back to the start.
pub const MAX_SEQUENCE: u32 = (1 << 31) - 1;

/// Sequence 0 is reserved for the line counter reset (`M110 N0`) the queue
/// transmits when a session starts; regular assignment skips it.
pub const RESERVED_SEQUENCE: u32 = 0;

/// Planner feed estimator: sample window size.
pub const FEED_QUEUE_SIZE: usize = 10_000;

/// Planner feed estimator: which percentile to compute.
pub const FEED_HEAP_RATIO: f64 = 0.95;

/// Planner feed estimator: confirmations slower than this are not samples.
pub const FEED_IGNORE_ABOVE: Duration = Duration::from_secs(1);

/// Planner feed estimator: threshold used before enough samples exist.
pub const FEED_DEFAULT_THRESHOLD: Duration = Duration::from_millis(130);

/// SD watcher tick period.
pub const SD_INTERVAL: Duration = Duration::from_millis(200);

/// How often the SD tree is rebuilt without an explicit invalidation.
pub const SD_FILESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Name of the SD card mount point in long file paths.
pub const SD_MOUNT_NAME: &str = "SD Card";

/// Default retry interval after a failed gather or validation.
pub const ON_FAIL_INTERVAL: Duration = Duration::from_secs(5);

/// How many trailing commands a sliced file spends on end-of-print moves.
pub const TAIL_COMMANDS: u64 = 10;

/// Default BCM pin wired to the printer reset line.
pub const DEFAULT_RESET_PIN: u8 = 22;

/// BCM pin hard-grounded on the target board; reset must refuse it.
pub const GROUNDED_RESET_PIN: u8 = 23;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_reprap_reference() {
        // Reference values from the RepRap wire documentation.
        assert_eq!(checksum("N3 T0"), 57);
        assert_eq!(checksum("N4 M105"), 36);
    }

    #[test]
    fn test_frame_line_layout() {
        assert_eq!(frame_line(3, "T0"), "N3 T0*57\n");
        assert_eq!(frame_line(4, "M105"), "N4 M105*36\n");
    }

    #[test]
    fn test_parse_resend() {
        assert_eq!(parse_resend("Resend: 12").unwrap(), 12);
        assert_eq!(parse_resend("Resend:7").unwrap(), 7);
        assert!(parse_resend("Resend: banana").is_err());
    }

    #[test]
    fn test_ok_and_boot_tokens() {
        assert!(OK_REGEX.is_match("ok"));
        assert!(OK_REGEX.is_match("ok T:24.9 /0.0"));
        assert!(!OK_REGEX.is_match("okay"));
        assert!(PRINTER_BOOT_REGEX.is_match("start"));
    }

    #[test]
    fn test_error_family_groups() {
        let caps = ERROR_REGEX.captures("Error: stopped").unwrap();
        assert!(caps.name("stop").is_some());
        assert!(caps.name("temp").is_none());

        let caps = ERROR_REGEX
            .captures("Error:MAXTEMP triggered, system stopped! Heater_ID: bed")
            .unwrap();
        assert!(caps.name("maxtemp").is_some());
        assert!(caps.name("bed").is_some());

        let caps = ERROR_REGEX
            .captures("Error:MINTEMP triggered, system stopped! Heater_ID: 0")
            .unwrap();
        assert!(caps.name("mintemp").is_some());
        assert!(caps.name("bed").is_none());

        let caps = ERROR_REGEX
            .captures("Error:Heatbed Thermal Runaway, system stopped!")
            .unwrap();
        assert!(caps.name("heatbed_runaway").is_some());
    }

    #[test]
    fn test_fan_error_names_the_fan() {
        let caps = FAN_ERROR_REGEX.captures("E3: Extruder fan error").unwrap();
        assert_eq!(&caps["fan_name"], "Extruder");
    }

    #[test]
    fn test_lfn_capture_shapes() {
        let caps = LFN_CAPTURE
            .captures(r#"DIR_ENTER: /OLD/ "old models""#)
            .unwrap();
        assert!(caps.name("dir_enter").is_some());
        assert_eq!(&caps["dir_lfn"], "old models");

        let caps = LFN_CAPTURE
            .captures(r#"BENCHY~1.GCO 154208 "benchy boat.gcode""#)
            .unwrap();
        assert!(caps.name("file").is_some());
        assert_eq!(&caps["sfn"], "BENCHY~1.GCO");
        assert_eq!(&caps["size"], "154208");
        assert_eq!(&caps["lfn"], "benchy boat.gcode");

        assert!(LFN_CAPTURE
            .captures("DIR_EXIT")
            .unwrap()
            .name("dir_exit")
            .is_some());
    }

    #[test]
    fn test_open_result_groups() {
        let caps = OPEN_RESULT_REGEX
            .captures("Now fresh file: test.gco")
            .unwrap();
        assert!(caps.name("ok").is_some());

        let caps = OPEN_RESULT_REGEX
            .captures("open failed, File: missing.gco")
            .unwrap();
        assert!(caps.name("ok").is_none());
        assert!(caps.name("failure").is_some());
    }

    #[test]
    fn test_rejection_token() {
        let caps = REJECTION_REGEX
            .captures(r#"echo:Unknown command: "M999123""#)
            .unwrap();
        assert_eq!(&caps["unknown"], "M999123");
    }

    #[test]
    fn test_state_layer_flattening() {
        assert_eq!(State::from(BaseState::Ready), State::Ready);
        assert_eq!(State::from(PrintingState::Stopped), State::Stopped);
        assert_eq!(State::from(OverrideState::Error), State::Error);
        assert!(State::Paused.is_printing_layer());
        assert!(!State::Busy.is_printing_layer());
    }
}
