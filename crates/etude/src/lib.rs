// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod credentials;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod response;
pub mod server;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::{LogConfig, ServerConfig, TriggerMode};
pub use credentials::{
    ClientPool, CredentialClient, CredentialStore, MemoryCredentialStore, PooledCredentialStore,
};
pub use error::{EtudeError, EtudeResult};
pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{Server, ShutdownHandle};
