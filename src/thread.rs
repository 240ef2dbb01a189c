use anyhow::Result;
use log::error;

use crate::time::sleep;

/// Restarts the device. On the host this ends the process.
#[cfg(target_os = "espidf")]
pub fn restart() -> ! {
    log::logger().flush();
    esp_idf_hal::reset::restart();
}

/// Restarts the device. On the host this ends the process.
#[cfg(not(target_os = "espidf"))]
pub fn restart() -> ! {
    log::logger().flush();
    std::process::exit(0);
}

/// Handles program failure by restarting the device.
///
/// This function waits for a second and then restarts the device if the program encounters an error.
pub fn failure() -> ! {
    // A supervisor that dies leaves the node unreachable. We wait for a
    // second so the log drains, then start a fresh boot cycle.
    sleep(1000);
    restart();
}

/// Runs the main application logic with automatic error logging and device restart on exit.
///
/// This function wraps the provided closure to ensure the device restarts
/// if the program exits. Any errors are logged with their full chain
/// before the restart occurs.
///
/// # Arguments
/// * `f` - A closure that returns a `Result`.
///
/// # Type Parameters
/// * `F` - The type of the closure.
///
/// # Returns
/// Never returns normally - either runs forever or restarts the device.
pub fn main<F>(f: F) -> !
where
    F: FnOnce() -> Result<()>,
{
    if let Err(e) = f() {
        error!("Fatal error: {:#}", e);
    }

    failure()
}
