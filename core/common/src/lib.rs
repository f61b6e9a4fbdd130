//! Common utilities and types shared across the Outpost crates.
//!
//! This module provides the error taxonomy, the identifiers and tags that
//! travel with queued mutations, and the clock every timestamp is read from.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{MutationId, OperationKind, Target};
