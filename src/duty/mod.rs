//! Duty-Status State Machine
//!
//! Validates and applies duty-status transitions for one driver, emitting
//! exactly one immutable event per transition. The session type wraps the
//! machine with the HOS calculator, motion debouncer, event log, and sync
//! queue into the single writer the concurrency model requires.

mod session;
mod state_machine;

pub use session::{
    spawn_session, DriverSession, RecordError, SessionCommand, SessionHandle,
};
pub use state_machine::{
    DutyStateMachine, StateToken, TransitionError, TransitionRequest,
};
