//! Session Manager
//!
//! Owns the set of live sessions: creation, per-owner quotas, turn
//! admission, cancellation, and idle eviction. The session table is the only
//! truly shared mutable structure in the engine; every mutation goes through
//! one async mutex per session entry, so cross-session operations never
//! block on each other.

pub mod manager;
pub mod types;

pub use manager::SessionManager;
pub use types::{
    Attachment, Session, SessionSnapshot, Turn, TurnHandle, TurnInput, TurnStatus,
};
