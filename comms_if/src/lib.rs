//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the software.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Command and response definitions for equipment (like the motor controller)
pub mod eqpt;

/// Network module
pub mod net;

/// Requests and responses exchanged with remote workers
pub mod work;
