//! Persistent state.

pub mod db;
pub mod lock;

pub use db::{DbError, KegRecord, StateDb};
pub use lock::PrefixLock;
