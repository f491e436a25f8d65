pub mod cli;
pub mod config;
pub mod datastore;
pub mod db;
pub mod engine;
pub mod error;
pub mod extract;
pub mod loader;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod schema;
pub mod stats;
pub mod status;
pub mod telemetry;

pub use error::{Result, RiskError};
