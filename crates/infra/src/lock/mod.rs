//! Distributed locks (lease store backed).

pub mod coordinator;
pub mod key;

pub use coordinator::LockCoordinator;
pub use key::LockKey;
