//! Session storage for warden
//!
//! The supervisor persists one session record per continuous run so that a
//! crashed run can be detected and closed by the next instance. This crate
//! only defines the store contract and two simple implementations; richer
//! backends live with the application that owns the schema.

pub mod entities;
pub mod error;
pub mod repositories;

pub use entities::{NewSession, SessionEnd, SessionRecord, SessionStats};
pub use error::{StorageError, StorageResult};
pub use repositories::{InMemorySessionStore, JsonFileSessionStore, SessionStore};
