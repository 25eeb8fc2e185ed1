//! Explicit state machine for the job lifecycle.
//!
//! The design separates:
//! - **State**: What the record store knows about a job (`Job`, `JobStatus`)
//! - **Events**: What happened to the current attempt (`JobEvent`)
//! - **Transition**: Pure function `(Job, JobEvent) -> JobTransition`
//!
//! The tracker reads the job, runs the transition and writes the result.

pub mod event;
pub mod state;
pub mod tracker;
pub mod transition;

pub use event::*;
pub use state::*;
pub use tracker::*;
pub use transition::*;
