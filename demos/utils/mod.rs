//! Utility functions for the demos
//!
//! Interface configuration shared by the example programs.

pub mod network;
