//! Stateful remote shell execution.
//!
//! Runs an ordered list of steps inside one persistent interactive shell
//! (over `ssh` or locally), telling command output apart from shell-ready
//! prompts and from programs waiting for input, and returns one result per
//! step. See `session::SessionBuilder` for the interactive engine and
//! `runner` for the batch modes.

pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod log;
pub mod paths;
pub mod prompt;
pub mod results;
pub mod runner;
pub mod sequencer;
pub mod session;
pub mod step;
pub mod transport;

pub use error::EngineError;
pub use results::{StepOutcome, StepResult};
pub use session::{SessionBuilder, SessionHandle, SessionStatus, start_session};
pub use step::Step;
