//! Recovery: the decision table and the periodic sweep that feeds it.

pub mod controller;
pub mod error;
pub mod sweeper;

pub use controller::{decide, ActionTaken, Decision, Outcome, RecoveryController};
pub use error::RecoveryError;
pub use sweeper::{SweepReport, SweepSettings, Sweeper};
