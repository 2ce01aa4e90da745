//! Server lifecycle: the caller-owned handle and the shared-instance helper.
//!
//! [`ViewerServer::start`] spawns one dedicated thread that runs the HTTP
//! accept/serve loop on its own current-thread tokio runtime, and only
//! returns once the listener has reported its bound address (or the bind
//! error) over a one-shot handshake channel. [`ViewerServer::get_or_start`]
//! layers the one-instance-per-process contract on top via a `OnceLock`:
//! repeat callers get the live server, with capacity and default-config
//! updates applied instead of a restart.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{error, info};

use crate::cache::{ArtifactCache, GzJsonConverter, ProfileConverter, DEFAULT_CAPACITY};
use crate::config::ConverterConfig;
use crate::navigation::NavigationMode;
use crate::port;
use crate::registry::{FileRegistry, RegistryError};
use crate::server::{self, ServerState};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("cannot bind a listening socket: {0}")]
    Bind(std::io::Error),
    #[error("cannot set up the artifact cache: {0}")]
    Cache(std::io::Error),
    #[error("cannot spawn the server thread: {0}")]
    Thread(std::io::Error),
    #[error("server thread exited before reporting its address")]
    Handshake,
}

/// Construction knobs for [`ViewerServer::start`]. `None` fields fall back
/// to defaults; `port: Some(0)` asks the OS for an ephemeral port directly.
#[derive(Default)]
pub struct ServerOptions {
    pub port: Option<u16>,
    pub cache_capacity: Option<u64>,
    pub config: Option<ConverterConfig>,
    pub navigation: NavigationMode,
    pub converter: Option<Arc<dyn ProfileConverter>>,
    pub ui_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl ServerOptions {
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_cache_capacity(mut self, bytes: Option<u64>) -> Self {
        self.cache_capacity = bytes;
        self
    }

    pub fn with_config(mut self, config: Option<ConverterConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_navigation(mut self, navigation: NavigationMode) -> Self {
        self.navigation = navigation;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ProfileConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_ui_dir(mut self, ui_dir: PathBuf) -> Self {
        self.ui_dir = Some(ui_dir);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Handle to a running viewer server. Owns the shared state and the server
/// thread; there is no shutdown, the server lives until the process exits.
pub struct ViewerServer {
    state: Arc<ServerState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ViewerServer {
    /// Start a server and block until its listener is bound.
    pub fn start(options: ServerOptions) -> Result<Self, StartError> {
        let ServerOptions {
            port,
            cache_capacity,
            config,
            navigation,
            converter,
            ui_dir,
            verbose,
        } = options;

        let port = match port {
            Some(port) => port,
            None => port::select_port().map_err(StartError::Bind)?,
        };
        let converter = converter.unwrap_or_else(|| Arc::new(GzJsonConverter));
        let cache = ArtifactCache::new(converter, cache_capacity.unwrap_or(DEFAULT_CAPACITY))
            .map_err(StartError::Cache)?;

        let state = Arc::new(ServerState {
            port: AtomicU16::new(port),
            registry: FileRegistry::new(),
            cache,
            default_config: RwLock::new(config.unwrap_or_default()),
            navigation,
            ui_dir: ui_dir.unwrap_or_else(|| PathBuf::from("ui")),
            verbose,
        });

        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("profview-http".into())
            .spawn(move || serve_on_dedicated_runtime(thread_state, port, ready_tx))
            .map_err(StartError::Thread)?;

        match ready_rx.recv() {
            Ok(Ok(addr)) => info!(%addr, "viewer server listening"),
            Ok(Err(err)) => return Err(StartError::Bind(err)),
            Err(_) => return Err(StartError::Handshake),
        }

        Ok(Self {
            state,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Start the process-wide instance on first call, reuse it afterwards.
    /// Later calls apply a supplied cache capacity or default config to the
    /// live server; everything else in `options` is ignored once running.
    pub fn get_or_start(options: ServerOptions) -> Result<&'static ViewerServer, StartError> {
        static INSTANCE: OnceLock<ViewerServer> = OnceLock::new();
        static INIT: Mutex<()> = Mutex::new(());

        let _init = INIT.lock().unwrap();
        if let Some(server) = INSTANCE.get() {
            if let Some(capacity) = options.cache_capacity {
                server.set_cache_capacity(capacity);
            }
            if let Some(config) = options.config {
                server.set_default_config(config);
            }
            return Ok(server);
        }
        let server = Self::start(options)?;
        Ok(INSTANCE.get_or_init(|| server))
    }

    /// The port the listener actually bound, which can differ from the
    /// requested one after an ephemeral-port fallback.
    pub fn port(&self) -> u16 {
        self.state.port()
    }

    /// Register a file to serve and return its logical name.
    pub fn register_file(
        &self,
        path: &Path,
        config: Option<ConverterConfig>,
    ) -> Result<String, RegistryError> {
        self.state.registry.register(path, config)
    }

    /// URL of the gzipped artifact for a registered logical name.
    pub fn artifact_url(&self, name: &str) -> String {
        server::artifact_url(self.port(), name)
    }

    /// Browser URL that opens the profiler UI on the named artifact.
    pub fn viewer_url(&self, name: &str) -> String {
        server::viewer_url(self.port(), name)
    }

    pub fn register_and_viewer_url(
        &self,
        path: &Path,
        config: Option<ConverterConfig>,
    ) -> Result<String, RegistryError> {
        let name = self.register_file(path, config)?;
        Ok(self.viewer_url(&name))
    }

    pub fn set_cache_capacity(&self, bytes: u64) {
        self.state.cache.set_capacity(bytes);
    }

    /// Replace the default config used for files without an override. The
    /// swap is atomic: a request sees the old or the new config, never a mix.
    pub fn set_default_config(&self, config: ConverterConfig) {
        *self.state.default_config.write().unwrap() = config;
    }

    /// Close the artifact cache, removing its on-disk directory. Meant for
    /// the process-exit path.
    pub fn close_cache(&self) {
        self.state.cache.close();
    }

    /// Block on the server thread. It never exits on its own, so this
    /// effectively parks the caller for the rest of the process.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn serve_on_dedicated_runtime(
    state: Arc<ServerState>,
    port: u16,
    ready: mpsc::Sender<Result<SocketAddr, std::io::Error>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    runtime.block_on(async move {
        let listener = match server::bind_listener(port).await {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        state.port.store(addr.port(), Ordering::SeqCst);
        let _ = ready.send(Ok(addr));

        let app = server::router(Arc::clone(&state));
        if let Err(err) = axum::serve(listener, app).await {
            error!("viewer server terminated: {}", err);
        }
    });
}
