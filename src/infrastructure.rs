//! Infrastructure layer for database connections, configuration and external integrations
//!
//! This module provides the SQLite state store, payload storage, configuration,
//! logging, and the DevTools remote-session provider.

pub mod config; // Configuration loading and defaults
pub mod database_connection;
pub mod devtools_session;
pub mod logging; // Logging infrastructure
pub mod payload_store;
pub mod state_store;

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager};
pub use database_connection::DatabaseConnection;
pub use devtools_session::{BrowserVersion, DevToolsSessionProvider};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use payload_store::PayloadStore;
pub use state_store::{SqliteStateStore, StateStore};
