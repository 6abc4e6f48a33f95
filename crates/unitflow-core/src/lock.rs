//! Lock modes requested for loads and `Session::lock`.

use serde::{Deserialize, Serialize};

/// Lock mode held on an entity for the current transaction.
///
/// Variants are declared weakest first; `Ord` follows declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    /// No lock; the entity was read from the identity map or not at all.
    #[default]
    None,
    /// Read from the database in this transaction.
    Read,
    /// Verify the version at transaction completion.
    Optimistic,
    /// Increment the version at transaction completion.
    OptimisticForceIncrement,
    /// `SELECT ... FOR SHARE`.
    PessimisticRead,
    /// `SELECT ... FOR UPDATE`.
    PessimisticWrite,
    /// `SELECT ... FOR UPDATE` and increment the version immediately.
    PessimisticForceIncrement,
}

impl LockMode {
    /// Is `self` a strictly stronger lock than `other`?
    pub fn greater_than(self, other: LockMode) -> bool {
        self > other
    }

    /// Does acquiring this mode issue a locking SELECT?
    pub const fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::PessimisticRead
                | LockMode::PessimisticWrite
                | LockMode::PessimisticForceIncrement
        )
    }

    /// Does this mode verify or bump the version before the transaction completes?
    pub const fn is_optimistic(self) -> bool {
        matches!(
            self,
            LockMode::Optimistic | LockMode::OptimisticForceIncrement
        )
    }

    /// Does this mode increment the version?
    pub const fn forces_increment(self) -> bool {
        matches!(
            self,
            LockMode::OptimisticForceIncrement | LockMode::PessimisticForceIncrement
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::Optimistic => "OPTIMISTIC",
            LockMode::OptimisticForceIncrement => "OPTIMISTIC_FORCE_INCREMENT",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
            LockMode::PessimisticForceIncrement => "PESSIMISTIC_FORCE_INCREMENT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_strength() {
        assert!(LockMode::PessimisticWrite.greater_than(LockMode::Read));
        assert!(!LockMode::None.greater_than(LockMode::None));
        assert!(LockMode::PessimisticForceIncrement.is_pessimistic());
        assert!(LockMode::PessimisticForceIncrement.forces_increment());
        assert!(LockMode::Optimistic.is_optimistic());
        assert!(!LockMode::Read.is_optimistic());
    }

    #[test]
    fn deserializes_from_screaming_case() {
        let mode: LockMode = serde_json::from_str("\"PESSIMISTIC_WRITE\"").unwrap();
        assert_eq!(mode, LockMode::PessimisticWrite);
    }
}
