//! Worker-side processors for the two queue channels.

mod request_processor;
mod routes;
mod update_processor;

#[cfg(test)]
pub(crate) mod testutil;

pub use request_processor::RequestProcessor;
pub use routes::register_routes;
pub use update_processor::{derive_status, extract_deployment, ExtractionError, UpdateProcessor};
