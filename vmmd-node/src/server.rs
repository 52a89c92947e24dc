//! Dispatch context shared by all command handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use vmmd_hypervisor::{MockBackend, NodeBackend, StorageBackend};
use vmmd_proto::{CommandError, Request, Response};

use crate::commands::COMMANDS;
use crate::config::Config;

/// Default per-command time bound.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The collaborators plus per-daemon state every handler can reach.
///
/// Handlers never touch node state themselves; they validate a request and
/// make one call into [`NodeBackend`] or [`StorageBackend`].
pub struct Server {
    node: Arc<dyn NodeBackend>,
    storage: Arc<dyn StorageBackend>,
    command_timeout: Option<Duration>,
    eos: AtomicBool,
}

impl Server {
    pub fn new(node: Arc<dyn NodeBackend>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            node,
            storage,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            eos: AtomicBool::new(false),
        }
    }

    /// A server backed by the in-memory collaborator.
    pub fn from_config(config: &Config) -> Self {
        let options = config.parser_options();
        info!(
            default_arch = %options.default_arch,
            keymap = %options.default_keymap,
            timeout = ?config.command_timeout(),
            "Using mock node backend"
        );
        let backend = Arc::new(
            MockBackend::with_options(options).with_frequency(config.nodes.poll_interval_ms),
        );
        Self::new(backend.clone(), backend).with_timeout(config.command_timeout())
    }

    /// Bound every command; `None` disables the bound.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn node(&self) -> &dyn NodeBackend {
        self.node.as_ref()
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    /// Whether a client asked the daemon to terminate.
    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    pub(crate) fn end_of_service(&self) {
        self.eos.store(true, Ordering::SeqCst);
    }

    /// Resolve, validate and run one command.
    #[instrument(skip(self, request), fields(command = %request.command))]
    pub async fn dispatch(&self, request: &Request) -> Result<Response, CommandError> {
        let handler = COMMANDS.resolve(&request.command)?;
        let call = handler(self, request);

        let Some(limit) = self.command_timeout else {
            return call.await;
        };

        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                let uri = request.uri().map(Value::from).unwrap_or(Value::Null);
                warn!(uri = %uri, timeout_secs = limit.as_secs(), "Command timed out");
                Err(CommandError::new(
                    request.command.clone(),
                    "Command {command} timed out after {seconds} seconds on node {uri}",
                )
                .arg("seconds", limit.as_secs())
                .arg("uri", uri))
            }
        }
    }

    /// Run one command and fold any error into the response.
    pub async fn handle(&self, request: &Request) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(command = %request.command, error = %err, "Command failed");
                Response::Error(err)
            }
        }
    }

    /// Run one command on its own task.
    pub fn spawn(self: &Arc<Self>, request: Request) -> JoinHandle<Response> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.handle(&request).await })
    }
}
