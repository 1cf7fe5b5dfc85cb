//! Logging shims.
//!
//! On the target these go to the RTT channel through `defmt`; on the host
//! they print so unit tests and the drain worker's diagnostics stay
//! readable in either build.

#[cfg(target_os = "none")]
pub fn log_info(message: &str) {
    defmt::info!("{=str}", message);
}

#[cfg(not(target_os = "none"))]
pub fn log_info(message: &str) {
    println!("{message}");
}

#[cfg(target_os = "none")]
pub fn log_warn(message: &str) {
    defmt::warn!("{=str}", message);
}

#[cfg(not(target_os = "none"))]
pub fn log_warn(message: &str) {
    println!("warning: {message}");
}

#[cfg(target_os = "none")]
pub fn log_error(message: &str) {
    defmt::error!("{=str}", message);
}

#[cfg(not(target_os = "none"))]
pub fn log_error(message: &str) {
    println!("error: {message}");
}
