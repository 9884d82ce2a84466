// codebox
// Sandboxed Python execution for conversational analysis agents

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod interceptor;
pub mod isolate;
pub mod outcome;
pub mod policy;
pub mod quota;
pub mod response;
pub mod scheduler;
pub mod validator;

#[cfg(feature = "server")]
pub mod gateway;

pub use config::EngineConfig;
pub use engine::{AnalysisCall, Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use outcome::{ExecutionOutcome, ExecutionRequest};
pub use response::{ExecuteArgs, ToolResponse};

/// Install the `tracing` subscriber used by the binaries (`RUST_LOG`, default `info`).
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        // Route `log` records from dependencies into the same subscriber.
        let _ = tracing_log::LogTracer::init();
    }
}
