//! Local viewer server for profiling recordings.
//!
//! Registers recording files under stable logical names, converts them to
//! gzipped profile JSON on demand (cached, single-flight per file+config),
//! and serves them together with a browser profiler UI. Embedders start a
//! [`ViewerServer`] (or share one via [`ViewerServer::get_or_start`]),
//! register files and hand the returned viewer URL to a browser; source
//! navigation between the UI and the embedder's editor tooling is wired up
//! through [`NavigationMode`].

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod navigation;
pub mod port;
pub mod registry;
mod server;

pub use cache::{ArtifactCache, ArtifactGuard, CacheError, GzJsonConverter, ProfileConverter};
pub use config::ConverterConfig;
pub use lifecycle::{ServerOptions, StartError, ViewerServer};
pub use navigation::{
    ClassLocation, FetchSourceFn, NavigateFn, NavigationDestination, NavigationMode,
};
pub use registry::{FileKind, FileRegistry, RegisteredFile, RegistryError};
