//! ID generation utilities.

use uuid::Uuid;

/// ID generator for queue records.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new UUID v7-based ID.
    ///
    /// UUID v7 values produced by one process are monotonic, so the string
    /// form sorts in creation order and can break ties between rows that
    /// share a timestamp.
    #[must_use]
    pub fn generate(&self) -> String {
        Uuid::now_v7().to_string()
    }
}
