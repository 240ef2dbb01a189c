use anyhow::Result;
use embedded_hal::digital::v2::OutputPin;
use log::{info, warn};
use std::fmt::Debug;

use esp_sensornode::{
    config::{Configuration, Policy},
    http::{HttpTransport, TelemetryClient},
    logic::{Session, Supervisor},
    ota::{FirmwareSlot, FirmwareUpdater},
    power::{PowerController, Sleeper},
    storage::Storage,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration built into the firmware, used until one is stored through the local server.
const FACTORY_CONFIG: Option<&str> = option_env!("NODE_CONFIG");

/// Sets up a power controller with every Vcc pin of `config`.
///
/// Pins that cannot be opened are skipped, so this never fails the boot.
fn power_controller<P, Z>(
    config: Option<&Configuration>,
    sleeper: Z,
    pin: impl FnMut(u8) -> Result<P>,
) -> PowerController<P, Z>
where
    P: OutputPin,
    P::Error: Debug,
    Z: Sleeper,
{
    let pins = config.into_iter().flat_map(Configuration::vcc_pins);
    PowerController::with_vcc_pins(sleeper, pins, pin)
}

/// One application cycle: sensors on, announce ourselves, confirm, rest.
fn application_cycle<S, T, U, O, P, Z>(
    supervisor: &Supervisor<S>,
    session: Session,
    transport: U,
    updater: &mut FirmwareUpdater<T, O>,
    power: &mut PowerController<P, Z>,
) -> Result<()>
where
    S: Storage,
    T: HttpTransport,
    U: HttpTransport,
    O: FirmwareSlot,
    P: OutputPin,
    P::Error: Debug,
    Z: Sleeper,
{
    let policy = policy(supervisor);
    let vcc_pins: Vec<u8> = power.vcc_pins().collect();
    for pin in vcc_pins {
        power.enable_vcc_pin(pin)?;
    }

    let mut telemetry = TelemetryClient::new(
        transport,
        session.base_url(),
        policy.transmit_timeout(),
        VERSION,
    );
    match telemetry.ping() {
        Ok(_) => info!("Ping acknowledged by {}", session.base_url()),
        Err(e) => warn!("Ping failed, will try again next cycle: {e}"),
    }

    supervisor.confirm_cycle(session, updater);
    power.rest(policy.rest_mode, policy.rest_duration())
}

fn policy<S: Storage>(supervisor: &Supervisor<S>) -> Policy {
    supervisor
        .config()
        .map(|config| config.policy().clone())
        .unwrap_or_default()
}

#[cfg(target_os = "espidf")]
fn main() {
    esp_sensornode::thread::main(device::run)
}

#[cfg(target_os = "espidf")]
mod device {
    use anyhow::Result;
    use esp_idf_hal::{
        gpio::{AnyOutputPin, PinDriver},
        prelude::Peripherals,
    };
    use esp_idf_svc::{eventloop::EspSystemEventLoop, log::EspLogger, nvs::EspDefaultNvsPartition};
    use log::{info, warn};

    use esp_sensornode::{
        http::EspTransport,
        logic::{Outcome, Supervisor},
        ota::{EspSlot, FirmwareUpdater},
        portal::EspPortalServer,
        power::ChipSleeper,
        reset::ChipReset,
        storage::{NvsStorage, NAMESPACE},
        thread,
        time::{millis, sleep},
        wifi::{ConnectivityManager, EspRadio},
    };

    use super::{application_cycle, policy, power_controller, FACTORY_CONFIG, VERSION};

    pub fn run() -> Result<()> {
        // It is necessary to call this function once. Otherwise some patches to the runtime
        // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
        esp_idf_svc::sys::link_patches();

        EspLogger::initialize_default();

        let peripherals = Peripherals::take()?;
        let sys_loop = EspSystemEventLoop::take()?;
        let partition = EspDefaultNvsPartition::take()?;
        let storage = NvsStorage::new(partition.clone(), NAMESPACE)?;

        let mut supervisor = Supervisor::init(storage, &ChipReset, FACTORY_CONFIG, VERSION);
        let mut net = ConnectivityManager::new(EspRadio::new(
            peripherals.modem,
            sys_loop,
            Some(partition),
        )?);
        let mut updater = FirmwareUpdater::new(EspTransport, EspSlot::default());
        let mut server = EspPortalServer::default();

        let outcome = supervisor.execute(&mut net, &mut updater, &mut server)?;
        let power = || {
            power_controller(supervisor.config(), ChipSleeper, |number| {
                // SAFETY: every Vcc pin is claimed exactly once, here.
                let pin = unsafe { AnyOutputPin::new(i32::from(number)) };
                Ok(PinDriver::output(pin)?)
            })
        };

        match outcome {
            Outcome::Run(session) => {
                application_cycle(&supervisor, session, EspTransport, &mut updater, &mut power())?;
            }
            Outcome::Serving { window } => {
                sleep(millis(window));
                info!("Local server window over");
            }
            Outcome::Reboot => {}
            Outcome::Offline(e) => {
                warn!("Offline this cycle: {e}");
                let policy = policy(&supervisor);
                power().rest(policy.rest_mode, policy.rest_duration())?;
            }
            Outcome::Halt => power().halt()?,
        }

        // Deep sleep never gets here; everything else starts over with a fresh boot.
        thread::restart()
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    host::run()
}

/// Runs boot cycles against simulated peripherals.
///
/// `node [CONFIG.json]` simulates `NODE_SIM_BOOTS` (default 3) consecutive
/// boots sharing one simulated flash.
#[cfg(not(target_os = "espidf"))]
mod host {
    use anyhow::{Context, Result};
    use env_logger::Env;
    use log::{info, warn};

    use esp_sensornode::{
        logic::{Outcome, Supervisor},
        ota::FirmwareUpdater,
        reset::ResetReason,
        sim::{Reply, SimPin, SimRadio, SimServer, SimSleeper, SimSlot, SimTransport},
        storage::RamStorage,
        wifi::ConnectivityManager,
    };

    use super::{application_cycle, policy, power_controller, FACTORY_CONFIG, VERSION};

    const DEFAULT_BOOTS: u32 = 3;

    pub fn run() -> Result<()> {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

        let document = std::env::args()
            .nth(1)
            .map(|path| std::fs::read_to_string(&path).with_context(|| format!("reading {path}")))
            .transpose()?;
        let factory = document.as_deref().or(FACTORY_CONFIG);
        let boots = match std::env::var("NODE_SIM_BOOTS") {
            Ok(value) => value.parse().context("NODE_SIM_BOOTS")?,
            Err(_) => DEFAULT_BOOTS,
        };

        let storage = RamStorage::new();
        let radio = SimRadio::default();
        let transport = SimTransport::default();
        let slot = SimSlot::default();
        let sleeper = SimSleeper::default();

        for boot in 1..=boots {
            let reset = if boot == 1 {
                ResetReason::PowerOn
            } else {
                ResetReason::DeepSleepWake
            };

            let mut supervisor = Supervisor::init(storage.clone(), &reset, factory, VERSION);
            let mut net = ConnectivityManager::new(radio.clone());
            let mut updater = FirmwareUpdater::new(transport.clone(), slot.clone());
            let mut server = SimServer::default();

            let outcome = supervisor.execute(&mut net, &mut updater, &mut server)?;
            let mut power =
                power_controller(supervisor.config(), sleeper.clone(), |_| Ok(SimPin::default()));

            match outcome {
                Outcome::Run(session) => {
                    transport.push(Reply::ok("{}"));
                    application_cycle(&supervisor, session, transport.clone(), &mut updater, &mut power)?;
                }
                Outcome::Serving { window } => {
                    info!("Local server would stay up for {}s", window.as_secs());
                }
                Outcome::Reboot => info!("Rebooting into new firmware"),
                Outcome::Offline(e) => {
                    warn!("Offline this cycle: {e}");
                    let policy = policy(&supervisor);
                    power.rest(policy.rest_mode, policy.rest_duration())?;
                }
                Outcome::Halt => {
                    power.halt()?;
                    break;
                }
            }
        }

        info!(
            "Simulated {} rest(s), {} request(s)",
            sleeper.rests().len(),
            transport.requests().len()
        );
        Ok(())
    }
}
