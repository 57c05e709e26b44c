//! Provisioning state machine.
//!
//! Every provisioning flow (CrOS, LaCrOS, Ash, firmware) is expressed as a
//! chain of [`State`]s, each holding an ordered batch of reversible
//! [`Command`]s. The [`StateMachineExecutor`] walks the chain and applies the
//! rollback policy when a command fails.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   StateMachineExecutor                      │
//! │  - execute(flow_id, initial, cancel) → ExecutionResult      │
//! │  - emits ExecutionEvents through an ExecutionNotifier       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          State                              │
//! │  - commands() → ordered Commands, built fresh per run       │
//! │  - next() → following State, None when terminal             │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Command                             │
//! │  - execute() / revert() against the remote device           │
//! │  - error_message() + status() describe a failure            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rollback is scoped to the failing state: the commands of that state that
//! already succeeded are reverted in reverse order, earlier states are left
//! untouched.

mod command;
mod error;
mod events;
mod executor;
mod state;
mod status;

pub use command::{Command, CommandError, CommandResultExt};
pub use error::ExecutionError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::{ExecutionResult, StateMachineExecutor};
pub use state::State;
pub use status::InstallStatus;
