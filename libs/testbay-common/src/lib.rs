pub mod backends;
pub mod config;
pub mod ingest;
pub mod jobs;
pub mod keys;
pub mod queue;
pub mod quota;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod types;
