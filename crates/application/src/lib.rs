//! Application layer of the Stratus autoscaler: the reconciliation engine
//! and the scale-up/scale-down planners it drives.

pub mod engine;
pub mod expander;
pub mod poll;
pub mod scale_down;
pub mod scale_up;
