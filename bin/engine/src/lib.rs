//! The stepweave engine process.
//!
//! Wires the workflow runner to PostgreSQL for step state and NATS JetStream
//! for queues, and loads workflow definitions from disk.

pub mod config;
pub mod db;
pub mod loader;

pub use config::EngineSettings;
pub use db::PgStepStore;
pub use loader::{LoadError, load_workflows};
