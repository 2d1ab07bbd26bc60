//! Core library for the rig_daq application.
//!
//! This library contains the cached-property instrument engine, the wire
//! codecs for each instrument family, the software PWM engine and the
//! drivers built from them. It is used by the headless `rig_daq` binary and
//! by the integration tests, which run every driver against protocol
//! simulators.

pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod parameter;
pub mod persistence;
pub mod protocol;
pub mod pwm;
pub mod registry;
