//! Local store: the persisted session and the profile cache.
//!
//! - `model`: rows as the session layer sees them.
//! - `repo`: SQL-only functions over the SQLite pool.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{CachedProfile, SessionKind, StoredSession};
