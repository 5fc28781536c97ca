//! Stack instance configuration

const DEFAULT_NAME: &str = "stack0";

/// Per-instance settings for a [`StackInstance`](crate::StackInstance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Name used in log lines, usually the interface name
    pub name: String,
    /// Upper bound on dispatch tasks running at once.
    ///
    /// `None` leaves dispatch unbounded. With `Some(n)` the receive loop waits
    /// for a free slot before handing the next frame to an engine.
    pub max_in_flight: Option<usize>,
}

impl StackConfig {
    pub fn new(name: impl Into<String>) -> Self {
        StackConfig {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            name: DEFAULT_NAME.to_string(),
            max_in_flight: None,
        }
    }
}
