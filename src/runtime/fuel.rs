//! Fuel for the machine

/// Step budget of a run. Every executed instruction burns one unit, a program
/// that loops forever faults once the tank is empty instead of hanging.
#[derive(Debug, Clone)]
pub struct Fuel {
    fuel: i64,
}

impl Fuel {
    pub fn with(fuel: i64) -> Self {
        Self { fuel }
    }

    /// Subtract from the current remaining fuel.
    pub fn consume(&mut self, fuel: i64) {
        self.fuel = self.fuel.saturating_sub(fuel);
    }

    pub fn should_continue(&self) -> bool {
        self.fuel > 0
    }
}

impl Default for Fuel {
    fn default() -> Self {
        Self::with(1_000_000)
    }
}
