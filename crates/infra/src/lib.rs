//! Infrastructure layer: lease store, distributed locks, job table, dispatcher.

pub mod jobs;
pub mod lease_store;
pub mod lock;
