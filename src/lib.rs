/// The main library module for the project.
///
/// This module re-exports all submodules, providing a central entry point for the library.
///
/// # Modules
/// * `config` - Device configuration document.
/// * `gate` - The once-per-boot routing decision.
/// * `http` - HTTP transport and telemetry client.
/// * `infra` - Infrastructure traits and utilities.
/// * `logic` - The boot supervisor.
/// * `ota` - Firmware update.
/// * `persist` - Boot counter, update flag and update request.
/// * `portal` - Local configuration and diagnostics server.
/// * `power` - Sleep and peripheral power gates.
/// * `reset` - Reset reason classification.
/// * `sim` - Simulated peripherals for host builds.
/// * `storage` - Non-volatile key/value storage.
/// * `thread` - Threading utilities.
/// * `time` - Time-related utilities.
/// * `wifi` - Wi-Fi connectivity and management.
pub mod config;
pub mod gate;
pub mod http;
pub mod infra;
pub mod logic;
pub mod ota;
pub mod persist;
pub mod portal;
pub mod power;
pub mod reset;
#[cfg(not(target_os = "espidf"))]
pub mod sim;
pub mod storage;
pub mod thread;
pub mod time;
pub mod wifi;
