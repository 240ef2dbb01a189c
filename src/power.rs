use anyhow::{anyhow, Result};
use embedded_hal::digital::v2::OutputPin;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use crate::infra::{State, Switch};

/// Low-power state used between boot cycles.
///
/// # Variants
/// * `Light` - Light sleep; the radio association survives and the call returns on wake.
/// * `Deep` - Deep sleep; the radio is shut down and wake is a fresh boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestMode {
    Light,
    Deep,
}

/// The chip-level sleep primitive.
pub trait Sleeper {
    /// Suspends everything for `duration`.
    ///
    /// # Errors
    /// Returns an error if the sleep could not be entered.
    fn sleep(&mut self, mode: RestMode, duration: Duration) -> Result<()>;

    /// Sleeps with no wake source; only an external reset ends it.
    ///
    /// # Errors
    /// Returns an error if the sleep could not be entered.
    fn halt(&mut self) -> Result<()>;
}

/// A GPIO that powers peripheral sensors.
pub struct VccGate<P: OutputPin> {
    pin: P,
    state: State,
}

impl<P> VccGate<P>
where
    P: OutputPin,
    P::Error: Debug,
{
    /// Wraps `pin` and drives it low so peripherals start unpowered.
    ///
    /// # Errors
    /// Returns an error if the pin cannot be driven.
    pub fn new(pin: P) -> Result<Self> {
        let mut gate = Self {
            pin,
            state: State::On,
        };
        gate.set(State::Off)?;
        Ok(gate)
    }
}

impl<P> Switch for VccGate<P>
where
    P: OutputPin,
    P::Error: Debug,
{
    fn set(&mut self, state: State) -> Result<()> {
        if self.state == state {
            return Ok(());
        }

        match state {
            State::On => self.pin.set_high(),
            State::Off => self.pin.set_low(),
        }
        .map_err(|e| anyhow!("Failed to drive power gate: {:?}", e))?;
        self.state = state;

        Ok(())
    }

    fn state(&self) -> State {
        self.state
    }
}

/// Parks the device between cycles and gates peripheral power.
pub struct PowerController<P: OutputPin, Z: Sleeper> {
    gates: BTreeMap<u8, VccGate<P>>,
    sleeper: Z,
}

impl<P, Z> PowerController<P, Z>
where
    P: OutputPin,
    P::Error: Debug,
    Z: Sleeper,
{
    #[must_use]
    pub fn new(sleeper: Z) -> Self {
        Self {
            gates: BTreeMap::new(),
            sleeper,
        }
    }

    /// Sets up a controller gating every pin in `pins`.
    ///
    /// A pin that `driver` cannot provide, or that cannot be driven low, is
    /// logged and left out; the boot goes on without those peripherals.
    ///
    /// # Arguments
    /// * `sleeper` - The chip's sleep primitive.
    /// * `pins` - GPIO numbers of the Vcc gates.
    /// * `driver` - Opens the output driving a GPIO.
    pub fn with_vcc_pins(
        sleeper: Z,
        pins: impl IntoIterator<Item = u8>,
        mut driver: impl FnMut(u8) -> Result<P>,
    ) -> Self {
        let mut power = Self::new(sleeper);
        for number in pins {
            if let Err(e) = driver(number).and_then(|pin| power.add_vcc_pin(number, pin)) {
                warn!("Skipping Vcc pin GPIO {number}: {e:#}");
            }
        }
        power
    }

    /// Registers the output driving GPIO `number`. The pin starts low.
    ///
    /// # Errors
    /// Returns an error if the pin cannot be driven.
    pub fn add_vcc_pin(&mut self, number: u8, pin: P) -> Result<()> {
        self.gates.insert(number, VccGate::new(pin)?);
        Ok(())
    }

    fn gate(&mut self, pin: u8) -> Result<&mut VccGate<P>> {
        self.gates
            .get_mut(&pin)
            .ok_or_else(|| anyhow!("GPIO {pin} is not a registered Vcc pin"))
    }

    /// Powers the peripherals behind `pin`. Idempotent.
    ///
    /// # Errors
    /// Returns an error if `pin` is unknown or cannot be driven.
    pub fn enable_vcc_pin(&mut self, pin: u8) -> Result<()> {
        self.gate(pin)?.set(State::On)
    }

    /// Cuts power to the peripherals behind `pin`. Idempotent.
    ///
    /// # Errors
    /// Returns an error if `pin` is unknown or cannot be driven.
    pub fn disable_vcc_pin(&mut self, pin: u8) -> Result<()> {
        self.gate(pin)?.set(State::Off)
    }

    /// GPIO numbers of the registered Vcc gates, in ascending order.
    pub fn vcc_pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.gates.keys().copied()
    }

    /// Returns `true` if the peripherals behind `pin` are powered.
    #[must_use]
    pub fn is_powered(&self, pin: u8) -> bool {
        self.gates.get(&pin).is_some_and(|gate| gate.state().is_on())
    }

    fn power_down_peripherals(&mut self) -> Result<()> {
        for gate in self.gates.values_mut() {
            gate.set(State::Off)?;
        }
        Ok(())
    }

    /// Ends the cycle: peripherals off, then sleep for `duration`.
    ///
    /// In [`RestMode::Deep`] this does not return on the device; the next
    /// thing that runs is a new boot.
    ///
    /// # Errors
    /// Returns an error if a pin cannot be driven or the sleep cannot be entered.
    pub fn rest(&mut self, mode: RestMode, duration: Duration) -> Result<()> {
        self.power_down_peripherals()?;
        info!("Resting in {mode:?} sleep for {}ms", duration.as_millis());
        log::logger().flush();

        self.sleeper.sleep(mode, duration)
    }

    /// Idles with peripherals off until an external reset.
    ///
    /// # Errors
    /// Returns an error if a pin cannot be driven or the sleep cannot be entered.
    pub fn halt(&mut self) -> Result<()> {
        self.power_down_peripherals()?;
        info!("Halting until the next external reset");
        log::logger().flush();

        self.sleeper.halt()
    }
}

/// Timer-driven light and deep sleep of the ESP32.
#[cfg(target_os = "espidf")]
pub struct ChipSleeper;

#[cfg(target_os = "espidf")]
impl Sleeper for ChipSleeper {
    fn sleep(&mut self, mode: RestMode, duration: Duration) -> Result<()> {
        use esp_idf_svc::sys::{self, esp};

        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        match mode {
            RestMode::Light => {
                esp!(unsafe { sys::esp_sleep_enable_timer_wakeup(micros) })?;
                esp!(unsafe { sys::esp_light_sleep_start() })?;
                Ok(())
            }
            RestMode::Deep => unsafe { sys::esp_deep_sleep(micros) },
        }
    }

    fn halt(&mut self) -> Result<()> {
        unsafe { esp_idf_svc::sys::esp_deep_sleep_start() }
    }
}
