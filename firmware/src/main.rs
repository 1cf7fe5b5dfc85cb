#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate panic_halt;

mod events;
mod log;
mod settings;
mod state;
mod status;
mod sync;
mod testers;

#[cfg(target_os = "none")]
mod hw;
#[cfg(target_os = "none")]
mod runtime;
#[cfg(target_os = "none")]
mod store;

#[cfg(test)]
mod testutil;

#[cfg(not(target_os = "none"))]
fn main() {}
