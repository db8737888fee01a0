//! # Equipment Interface
//!
//! This module defines the interface structures which are exchanged with the rover's equipment.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

/// Motor controller command vocabulary
pub mod motor;
