//! Request intake: validation, idempotency and queue hand-off.

pub mod identifier;
mod service;

pub use service::{CreateDeployment, IntakeService};
