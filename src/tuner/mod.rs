//! Tuner management: the arbiter, child-process supervisor, and live-stream session
//! state machine.

pub mod arbiter;
pub mod session;
pub mod supervisor;
