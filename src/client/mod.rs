//! Client half of the protocol: plans chunks, sends them with adaptive
//! parallelism and drives finalization.

pub mod planner;
pub mod scheduler;
pub mod transport;
pub mod tuning;
