//! Storage entity definitions

pub mod session;

pub use session::{NewSession, SessionEnd, SessionRecord, SessionStats};
