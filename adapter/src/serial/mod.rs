//! # Serial Pipeline
//!
//! Everything that touches the printer's serial line lives here.
//!
//! ## Module Organization
//!
//! - **matcher**: Maps inbound lines to registered pattern handlers
//! - **instruction**: One outbound G-code line with confirmation state
//! - **queue**: Ordered dispatch with resend handling and stall detection
//! - **planner_fed**: Rolling latency percentile over confirmations
//! - **link**: The port seam; a pump task owns the device exclusively
//!
//! The queue is the only writer: every outbound byte flows through its
//! dispatch loop and the pump task it feeds. Inbound bytes are split into
//! lines by the pump and handed to the [`matcher::LineMatcher`], which the
//! queue and the observers subscribe to.

pub mod instruction;
pub mod link;
pub mod matcher;
pub mod planner_fed;
pub mod queue;

use tokio::sync::watch;

use printer_protocol::QUIT_INTERVAL;

/// Waits for an instruction in `QUIT_INTERVAL` slices so shutdown stays
/// bounded. Returns true when the instruction confirmed, false when it
/// was abandoned or the component is shutting down.
pub async fn wait_for_instruction(
    instruction: &instruction::Instruction,
    running: &watch::Receiver<bool>,
) -> bool {
    loop {
        if !*running.borrow() {
            return false;
        }
        match tokio::time::timeout(QUIT_INTERVAL, instruction.wait()).await {
            Ok(confirmed) => return confirmed,
            Err(_) => continue,
        }
    }
}

pub use instruction::{CapturePattern, Instruction};
pub use link::{open_serial, serial_pump, DtrResetShim, PortCommand, ResetShim};
pub use matcher::{LineMatcher, MatchToken};
pub use planner_fed::PlannerFeed;
pub use queue::{SerialQueue, SessionFatal, StallEvent};
