//! # Rover library.
//!
//! This library allows other crates in the workspace to access items defined inside the rover
//! crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Frame source - provides encoded camera frames for classification
pub mod frame_source;

/// Maneuver sequencer - drives the rover around the obstacle course
pub mod mnvr_seq;

/// Motor link - serial line protocol to the motor controller
pub mod motor_link;

/// Executable parameters
pub mod params;

/// Work dispatcher - sends vision and planning requests to remote workers
pub mod work_dispatcher;

#[cfg(test)]
mod test_support;
