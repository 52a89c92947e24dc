//! Command registry and handlers.
//!
//! Each handler validates its request fields through [`Fields`], logs one
//! debug line, makes exactly one collaborator call and shapes the result
//! into a [`Response`]. Collaborator failures are wrapped into a
//! [`CommandError`] tagged with the command name.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument};

use vmmd_hypervisor::NodeError;
use vmmd_proto::{CommandError, NodeSnapshot, Request, Response};

use crate::server::Server;
use crate::validate::Fields;

/// Future returned by a command handler.
pub type HandlerFuture<'a> = BoxFuture<'a, Result<Response, CommandError>>;

/// A registered command handler.
pub type Handler = for<'a> fn(&'a Server, &'a Request) -> HandlerFuture<'a>;

/// Prefix of names that are never dispatched.
pub const RESTRICTED_PREFIX: &str = "_";

/// Every built-in command, built once on first use.
pub static COMMANDS: Lazy<CommandRegistry> = Lazy::new(CommandRegistry::builtin);

macro_rules! handler {
    ($handler:ident) => {{
        fn boxed<'a>(server: &'a Server, request: &'a Request) -> HandlerFuture<'a> {
            Box::pin($handler(server, request))
        }
        boxed as Handler
    }};
}

/// Name to handler lookup.
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    fn builtin() -> Self {
        let mut registry = Self::empty();

        // Nodes & groups
        registry.register("NODE_ADD", handler!(node_add));
        registry.register("NODE_REMOVE", handler!(node_remove));
        registry.register("NODE_QUERY", handler!(node_query));
        registry.register("NODE_FREQUENCY", handler!(node_frequency));
        registry.register("NODE_LIST", handler!(node_list));
        registry.register("GROUP_LIST", handler!(group_list));

        // Domains
        registry.register("DOMAIN_LIST", handler!(domain_list));
        registry.register("DOMAIN_INFO", handler!(domain_info));
        registry.register("DOMAIN_DEFINE", handler!(domain_define));
        registry.register("DOMAIN_STATE", handler!(domain_state));
        registry.register("DOMAIN_SAVE", handler!(domain_save));
        registry.register("DOMAIN_RESTORE", handler!(domain_restore));
        registry.register("DOMAIN_UNDEFINE", handler!(domain_undefine));
        registry.register("DOMAIN_MIGRATE", handler!(domain_migrate));
        registry.register("DOMAIN_SNAPSHOT_CREATE", handler!(domain_snapshot_create));
        registry.register("DOMAIN_SNAPSHOT_REVERT", handler!(domain_snapshot_revert));
        registry.register("DOMAIN_SNAPSHOT_DELETE", handler!(domain_snapshot_delete));
        registry.register("DOMAIN_UPDATE", handler!(domain_update));
        registry.register("DOMAIN_CLONE", handler!(domain_clone));
        registry.register("DOMAIN_TARGETHOST_ADD", handler!(domain_targethost_add));
        registry.register("DOMAIN_TARGETHOST_REMOVE", handler!(domain_targethost_remove));

        // Storage
        registry.register("STORAGE_POOLS", handler!(storage_pools));
        registry.register("STORAGE_VOLUMES", handler!(storage_volumes));
        registry.register("STORAGE_VOLUMES_DESTROY", handler!(storage_volumes_destroy));
        registry.register("STORAGE_VOLUME_USEDBY", handler!(storage_volume_used_by));

        registry.register("BYE", handler!(bye));

        registry
    }

    pub fn register(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    /// Look up a command, refusing restricted and unknown names.
    pub fn resolve(&self, name: &str) -> Result<Handler, CommandError> {
        if name.starts_with(RESTRICTED_PREFIX) {
            return Err(CommandError::restricted(name));
        }
        self.handlers
            .get(name)
            .copied()
            .ok_or_else(|| CommandError::unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Wrap a collaborator failure for `command`.
fn failed(command: &'static str) -> impl FnOnce(NodeError) -> CommandError {
    move |err| {
        error!(command, kind = ?err.kind, error = %err, "Collaborator call failed");
        CommandError::wrap(command, err.text)
    }
}

fn dump<T: Serialize + ?Sized>(command: &'static str, data: &T) -> Result<Response, CommandError> {
    Response::dump(&data).map_err(|err| {
        CommandError::new(command, "Failed to encode response: {error}")
            .arg("error", err.to_string())
    })
}

// =============================================================================
// Nodes & Groups
// =============================================================================

async fn node_add(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "NODE_ADD";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    debug!(uri, "NODE_ADD");

    server.node().node_add(uri).await.map_err(failed(COMMAND))?;
    info!(uri, "Node added");
    Ok(Response::Ok)
}

async fn node_remove(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "NODE_REMOVE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    debug!(uri, "NODE_REMOVE");

    server.node().node_remove(uri).await.map_err(failed(COMMAND))?;
    info!(uri, "Node removed");
    Ok(Response::Ok)
}

async fn node_query(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "NODE_QUERY";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    debug!(uri, "NODE_QUERY");

    let snapshot = server
        .node()
        .node_query(uri)
        .await
        .map_err(failed(COMMAND))?
        .ok_or_else(|| CommandError::new(COMMAND, "unknown node {uri}").arg("uri", uri))?;
    if !snapshot.is_connected() {
        return Err(CommandError::new(COMMAND, "Node {uri} is not available").arg("uri", uri));
    }
    dump(COMMAND, &*snapshot)
}

async fn node_frequency(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "NODE_FREQUENCY";
    let fields = Fields::new(COMMAND, request);
    let hz = fields.uint("hz")?;
    let uri = fields.optional_string("uri")?;
    debug!(hz, uri, "NODE_FREQUENCY");

    server
        .node()
        .node_frequency(hz, uri)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn node_list(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "NODE_LIST";
    let fields = Fields::new(COMMAND, request);
    let group = fields.string("group")?;
    let pattern = fields.string_or("pattern", "*")?;
    debug!(group, pattern, "NODE_LIST");

    let nodes = server
        .node()
        .node_list(group, pattern)
        .await
        .map_err(failed(COMMAND))?;
    let nodes: Vec<&NodeSnapshot> = nodes.iter().map(|node| &**node).collect();
    dump(COMMAND, &nodes)
}

async fn group_list(server: &Server, _request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "GROUP_LIST";
    debug!("GROUP_LIST");

    let groups = server.node().group_list().await.map_err(failed(COMMAND))?;
    dump(COMMAND, &groups)
}

// =============================================================================
// Domain Queries
// =============================================================================

async fn domain_list(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_LIST";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let pattern = fields.string_or("pattern", "*")?;
    debug!(uri, pattern, "DOMAIN_LIST");

    let domains = server
        .node()
        .domain_list(uri, pattern)
        .await
        .map_err(failed(COMMAND))?;
    dump(COMMAND, &domains)
}

async fn domain_info(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_INFO";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    debug!(uri, domain, "DOMAIN_INFO");

    let info = server
        .node()
        .domain_info(uri, domain)
        .await
        .map_err(failed(COMMAND))?;
    dump(COMMAND, &info)
}

// =============================================================================
// Domain Lifecycle
// =============================================================================

#[instrument(skip_all, fields(uri = ?request.uri()))]
async fn domain_define(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_DEFINE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.domain("domain")?;
    debug!(uri, name = %domain.name, "DOMAIN_DEFINE");

    let outcome = server
        .node()
        .domain_define(uri, domain)
        .await
        .map_err(failed(COMMAND))?;
    Ok(dump(COMMAND, &outcome.uuid)?.with_messages(outcome.warnings))
}

#[instrument(skip_all, fields(uri = ?request.uri()))]
async fn domain_state(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_STATE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let state = fields.target_state("state")?;
    debug!(uri, domain, state = state.as_str(), "DOMAIN_STATE");

    server
        .node()
        .domain_state(uri, domain, state)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_save(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_SAVE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let statefile = fields.string("statefile")?;
    debug!(uri, domain, statefile, "DOMAIN_SAVE");

    server
        .node()
        .domain_save(uri, domain, statefile)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_restore(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_RESTORE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.optional_string("domain")?;
    let statefile = fields.string("statefile")?;
    debug!(uri, domain, statefile, "DOMAIN_RESTORE");

    server
        .node()
        .domain_restore(uri, statefile)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_undefine(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_UNDEFINE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let volumes = fields.nullable_string_list("volumes")?;
    debug!(uri, domain, volumes = ?volumes, "DOMAIN_UNDEFINE");

    server
        .node()
        .domain_undefine(uri, domain, volumes.as_deref())
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

#[instrument(skip_all, fields(uri = ?request.uri()))]
async fn domain_migrate(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_MIGRATE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let target_uri = fields.string("target_uri")?;
    debug!(uri, domain, target_uri, "DOMAIN_MIGRATE");

    server
        .node()
        .domain_migrate(uri, domain, target_uri)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_update(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_UPDATE";
    let fields = Fields::new(COMMAND, request);
    let domain = fields.string("domain")?;
    debug!(domain, "DOMAIN_UPDATE");

    server
        .node()
        .domain_update(domain)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_clone(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_CLONE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let name = fields.string("name")?;
    let subst = fields.substitutions("subst")?;
    debug!(uri, domain, name, "DOMAIN_CLONE");

    let outcome = server
        .node()
        .domain_clone(uri, domain, name, &subst)
        .await
        .map_err(failed(COMMAND))?;
    Ok(dump(COMMAND, &outcome.uuid)?.with_messages(outcome.warnings))
}

// =============================================================================
// Snapshots & Migration Targets
// =============================================================================

/// `uri`, `domain` and `snapshot`, in that order.
fn snapshot_fields<'a>(
    command: &'static str,
    request: &'a Request,
) -> Result<(&'a str, &'a str, &'a str), CommandError> {
    let fields = Fields::new(command, request);
    Ok((
        fields.string("uri")?,
        fields.string("domain")?,
        fields.string("snapshot")?,
    ))
}

async fn domain_snapshot_create(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_SNAPSHOT_CREATE";
    let (uri, domain, snapshot) = snapshot_fields(COMMAND, request)?;
    debug!(uri, domain, snapshot, "DOMAIN_SNAPSHOT_CREATE");

    server
        .node()
        .domain_snapshot_create(uri, domain, snapshot)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_snapshot_revert(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_SNAPSHOT_REVERT";
    let (uri, domain, snapshot) = snapshot_fields(COMMAND, request)?;
    debug!(uri, domain, snapshot, "DOMAIN_SNAPSHOT_REVERT");

    server
        .node()
        .domain_snapshot_revert(uri, domain, snapshot)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_snapshot_delete(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_SNAPSHOT_DELETE";
    let (uri, domain, snapshot) = snapshot_fields(COMMAND, request)?;
    debug!(uri, domain, snapshot, "DOMAIN_SNAPSHOT_DELETE");

    server
        .node()
        .domain_snapshot_delete(uri, domain, snapshot)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_targethost_add(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_TARGETHOST_ADD";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let targethost = fields.string("targethost")?;
    debug!(uri, domain, targethost, "DOMAIN_TARGETHOST_ADD");

    server
        .node()
        .domain_targethost_add(uri, domain, targethost)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn domain_targethost_remove(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "DOMAIN_TARGETHOST_REMOVE";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let domain = fields.string("domain")?;
    let targethost = fields.string("targethost")?;
    debug!(uri, domain, targethost, "DOMAIN_TARGETHOST_REMOVE");

    server
        .node()
        .domain_targethost_remove(uri, domain, targethost)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

// =============================================================================
// Storage
// =============================================================================

async fn storage_pools(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "STORAGE_POOLS";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    debug!(uri, "STORAGE_POOLS");

    let pools = server
        .storage()
        .storage_pools(uri)
        .await
        .map_err(failed(COMMAND))?;
    dump(COMMAND, &pools)
}

async fn storage_volumes(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "STORAGE_VOLUMES";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let pool = fields.string("pool")?;
    let device = fields.optional_string("type")?;
    debug!(uri, pool, device, "STORAGE_VOLUMES");

    let volumes = server
        .storage()
        .storage_volumes(uri, pool, device)
        .await
        .map_err(failed(COMMAND))?;
    dump(COMMAND, &volumes)
}

async fn storage_volumes_destroy(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "STORAGE_VOLUMES_DESTROY";
    let fields = Fields::new(COMMAND, request);
    let uri = fields.string("uri")?;
    let volumes = fields.string_list("volumes")?;
    debug!(uri, count = volumes.len(), "STORAGE_VOLUMES_DESTROY");

    server
        .storage()
        .storage_volumes_destroy(uri, &volumes)
        .await
        .map_err(failed(COMMAND))?;
    Ok(Response::Ok)
}

async fn storage_volume_used_by(server: &Server, request: &Request) -> Result<Response, CommandError> {
    const COMMAND: &str = "STORAGE_VOLUME_USEDBY";
    let fields = Fields::new(COMMAND, request);
    let volume = fields.string("volume")?;
    debug!(volume, "STORAGE_VOLUME_USEDBY");

    let users = server
        .storage()
        .storage_volume_used_by(volume)
        .await
        .map_err(failed(COMMAND))?;
    dump(COMMAND, &users)
}

async fn bye(server: &Server, _request: &Request) -> Result<Response, CommandError> {
    debug!("BYE");
    server.end_of_service();
    info!("End of service requested");
    Ok(Response::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue() {
        for name in [
            "NODE_ADD",
            "NODE_REMOVE",
            "NODE_QUERY",
            "NODE_FREQUENCY",
            "NODE_LIST",
            "GROUP_LIST",
            "DOMAIN_DEFINE",
            "DOMAIN_STATE",
            "DOMAIN_SAVE",
            "DOMAIN_RESTORE",
            "DOMAIN_UNDEFINE",
            "DOMAIN_MIGRATE",
            "STORAGE_POOLS",
            "BYE",
        ] {
            assert!(COMMANDS.contains(name), "{name} is not registered");
        }
        assert!(!COMMANDS.names().iter().any(|name| name.starts_with(RESTRICTED_PREFIX)));
    }

    #[test]
    fn test_resolve_rejects_restricted_and_unknown() {
        let err = COMMANDS.resolve("_private").err().unwrap();
        assert_eq!(err.template(), "Restricted command {command}");
        assert_eq!(err.command, "_private");

        let err = COMMANDS.resolve("L_CLOUD_ADD").err().unwrap();
        assert_eq!(err.text.render(), "Unknown command L_CLOUD_ADD");

        // lookups are exact
        assert!(COMMANDS.resolve("node_add").is_err());
    }

    #[test]
    fn test_register_overrides() {
        let mut registry = CommandRegistry::empty();
        registry.register("BYE", handler!(bye));
        assert_eq!(registry.names(), ["BYE"]);
        assert!(registry.resolve("_BYE").is_err());
    }
}
