use anyhow::Result;

/// Represents the state of a Switch.
///
/// # Variants
/// * `On` - The Switch is turned on.
/// * `Off` - The Switch is turned off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    On,
    Off,
}

impl State {
    /// Returns `true` if the state is `On`.
    #[must_use]
    pub fn is_on(self) -> bool {
        self == State::On
    }
}

/// A trait representing a switch driven to an explicit state.
///
/// # Errors
/// This trait's methods return an error if the underlying output cannot be driven.
pub trait Switch {
    /// Drives the switch to the given state. Driving it to its current state is a no-op.
    ///
    /// # Errors
    /// Returns an error if the output cannot be driven.
    fn set(&mut self, state: State) -> Result<()>;

    /// Returns the last state the switch was driven to.
    fn state(&self) -> State;
}
