//! conveyor: asynchronous deployment pipeline for a container-orchestration cluster.
//!
//! Accepts user requests to create, update or delete a workload, processes them
//! through a durable Redis-streams queue, applies the change to the cluster and
//! reconciles cluster-observed state back into Postgres via a change-feed watcher.

// Core modules
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod intake;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export commonly used error types
pub use cluster::ClusterError;
pub use error::IntakeError;
pub use queue::QueueError;
pub use store::StoreError;
