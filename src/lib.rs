pub mod aggregate;
pub mod config;
pub mod fetch;
pub mod geo;
pub mod ingest;
pub mod output;
pub mod store;
