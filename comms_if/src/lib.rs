//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the software.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Goal requests, responses and results exchanged with trajectory clients
pub mod goal;

/// Network module
pub mod net;

/// Binary records exchanged with the robot's real-time controller
pub mod rt;
