//! # Print Host Adapter Library
//!
//! This library mediates between a 3D printer's serial (G-code) interface
//! and higher-level orchestration: a cloud control plane, a local API and
//! file-based print sources. The printer is the only authority on its own
//! state, so everything here is built around observing the serial line and
//! attributing what is observed to whoever caused it.
//!
//! ## Architecture
//!
//! The adapter is organized into several layers:
//!
//! - **serial**: The ordered, confirmation-driven outbound queue with
//!   resend handling, the inbound line matcher and the port seam
//! - **state**: The three-layer printer state machine fusing serial-line
//!   events, command intents and hardware error signals
//! - **values**: The refresh / timeout / validation scheduler for named
//!   observable values
//! - **commands**: High-level operations (start, pause, resume, stop,
//!   execute, filament handling, reset, job info) built on the queue
//! - **sd**: The SD card watcher with long/short name translation
//! - **signal**: In-process typed publish/subscribe used to wire the
//!   observers together
//!
//! ## Concurrency Model
//!
//! Background work runs on tokio tasks: one serial pump owning the port,
//! one queue dispatch loop, three value-updater workers, the SD watcher
//! tick and an on-demand error-reason waiter. Every long wait is raced
//! against a shutdown channel in `QUIT_INTERVAL` slices so teardown
//! completes within `EXIT_TIMEOUT`.
//!
//! ## Usage Example
//!
//! ```no_run
//! use printhost_adapter::config::Settings;
//! use printhost_adapter::supervisor::Supervisor;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = Settings::from_file("adapter.toml")?;
//! let supervisor = Supervisor::connect(&settings).await?;
//!
//! // Commands run against the supervisor's context until shutdown.
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Public module declarations
pub mod commands;
pub mod config;
pub mod job;
pub mod sd;
pub mod serial;
pub mod signal;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod values;

// Public Re-exports

pub use self::commands::{Command, CommandContext, CommandError, CommandRequest};
pub use self::serial::instruction::Instruction;
pub use self::serial::matcher::LineMatcher;
pub use self::serial::queue::SerialQueue;
pub use self::signal::Signal;
pub use self::state::{StateChange, StateManager};
pub use self::values::{ItemUpdater, WatchedGroup, WatchedItem};

/// Adapter version, stamped into the boot log.
pub const ADAPTER_VERSION: &str = env!("CARGO_PKG_VERSION");
