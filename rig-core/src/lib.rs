#![no_std]

// Portable logic for the UPS conformance-test rig.
//
// This crate stays buildable for both the MCU firmware and host tooling by
// avoiding the Rust standard library. It holds the status-word protocol, the
// device state machine, the active-test table, the test lifecycle engine and
// the settings/persistence seams; anything that needs an executor or a HAL
// lives in the firmware crate.

pub mod fsm;
pub mod lifecycle;
pub mod load;
pub mod sched;
pub mod settings;
pub mod status;
pub mod store;
pub mod types;
