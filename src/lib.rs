//! Core library for the agnw_lab controller.
//!
//! This library contains the process controller, experiment lifecycle state
//! machine, append-only history store, and surrogate-model suggestion engine
//! for an autonomous silver-nanowire synthesis rig. It is used by the
//! campaign binary and by integrations supplying real hardware behind the
//! [`devices::DeviceBus`] trait.

pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod history;
pub mod messages;
pub mod optimizer;
pub mod outcome;
pub mod params;
pub mod state;
pub mod supervisor;
