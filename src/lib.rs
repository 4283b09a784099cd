// Core modules
pub mod broker;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod execution;
pub mod feed;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{Engine, EngineReport};
pub use error::{BrokerError, ExecutionError, StoreError};
pub use models::*;
pub use strategy::{BreakoutDetector, Detector};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
