//! Transaction management.
//!
//! A `Session` is the user-facing unit of work. Nested sessions on the same
//! thread share one root `Transaction`, which owns the per-domain storage
//! write sets, the change tracking, the queued domain events and the lock
//! set. Only the root commits.

pub mod command;
pub mod events;
pub mod session;
pub mod tracking;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use command::Command;
pub use events::{
    Diagnostic, DomainEvent, SessionCompletion, SessionHooks, StoreEvents, Subscribers,
    SubscriptionId,
};
pub use session::{Session, SessionState};
pub use tracking::{TrackingEntry, TrackingSet, TrackingState};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque transaction identifier. Also the owner id in the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Read isolation of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Other sessions' uncommitted writes are never visible.
    #[default]
    ReadCommitted,
    /// Read-committed, plus a Shared lock on every identity read, held until
    /// the session completes.
    Serializable,
}

/// Transaction trait that all storage write sets implement.
pub trait Transaction: Send + Sync {
    fn mode(&self) -> TxMode;
    fn id(&self) -> TxId;
}
