#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod engine;
mod error;
mod mapper;
pub mod paths;
mod reference;

pub use crate::config::{
    CompilerOptions, ConfigFile, ConfigHost, FsHost, MemoryHost, OutputDescriptor, OutputTables,
    ProjectReference, ResolvedConfig, ResolvedReference, SourceDescriptor,
};
pub use crate::engine::{Scheduler, Unit, WorkQueue};
pub use crate::error::*;
pub use crate::mapper::{LoaderOptions, ProjectReferenceMap};
pub use crate::reference::ReferenceUnit;

/// Installs a global `tracing` subscriber printing to stderr, filtered through
/// `RUST_LOG` (defaults to `info`).
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
}
