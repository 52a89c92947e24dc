//! Collaborator interfaces consumed by the command layer.
//!
//! The command layer validates requests and delegates here; everything that
//! touches a hypervisor happens behind these traits. Every method may block
//! on network I/O and reports failures as [`NodeError`](crate::NodeError).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use vmmd_proto::{
    DefineOutcome, Domain, DomainSummary, GroupSnapshot, NodeSnapshot, StoragePool, StorageVolume,
    TargetState,
};

use crate::error::Result;

/// Clone substitutions: `mac`, `mac#<address>`, `copy#<target>`, `name#<target>`.
pub type CloneSubstitutions = BTreeMap<String, Option<String>>;

/// Node, domain and group management.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    // =========================================================================
    // Nodes & Groups
    // =========================================================================

    /// Start watching a node.
    async fn node_add(&self, uri: &str) -> Result<()>;

    /// Stop watching a node.
    async fn node_remove(&self, uri: &str) -> Result<()>;

    /// Latest snapshot of a node, `None` when the URI is not watched.
    ///
    /// A returned snapshot has `conn == None` while the node is unreachable.
    async fn node_query(&self, uri: &str) -> Result<Option<Arc<NodeSnapshot>>>;

    /// Set the polling interval in milliseconds for one node or, with
    /// `uri == None`, for all of them.
    async fn node_frequency(&self, hz: u64, uri: Option<&str>) -> Result<()>;

    /// Watched nodes of `group` whose URI matches the shell pattern.
    async fn node_list(&self, group: &str, pattern: &str) -> Result<Vec<Arc<NodeSnapshot>>>;

    async fn group_list(&self) -> Result<Vec<GroupSnapshot>>;

    // =========================================================================
    // Domain Queries
    // =========================================================================

    /// Domains whose name matches the shell pattern, keyed by node URI.
    ///
    /// An empty `uri` lists all nodes.
    async fn domain_list(&self, uri: &str, pattern: &str) -> Result<BTreeMap<String, Vec<DomainSummary>>>;

    async fn domain_info(&self, uri: &str, domain: &str) -> Result<Domain>;

    // =========================================================================
    // Domain Lifecycle
    // =========================================================================

    /// Define or redefine a domain; returns the assigned uuid.
    async fn domain_define(&self, uri: &str, domain: Domain) -> Result<DefineOutcome>;

    async fn domain_state(&self, uri: &str, domain: &str, state: TargetState) -> Result<()>;

    async fn domain_save(&self, uri: &str, domain: &str, statefile: &str) -> Result<()>;

    async fn domain_restore(&self, uri: &str, statefile: &str) -> Result<()>;

    /// Remove a domain definition and the listed volumes.
    ///
    /// `volumes == None` removes every volume the domain uses.
    async fn domain_undefine(&self, uri: &str, domain: &str, volumes: Option<&[String]>) -> Result<()>;

    async fn domain_migrate(&self, uri: &str, domain: &str, target_uri: &str) -> Result<()>;

    /// Re-read a domain on whichever node holds it.
    async fn domain_update(&self, domain: &str) -> Result<()>;

    async fn domain_clone(
        &self,
        uri: &str,
        domain: &str,
        name: &str,
        subst: &CloneSubstitutions,
    ) -> Result<DefineOutcome>;

    // =========================================================================
    // Snapshots & Metadata
    // =========================================================================

    async fn domain_snapshot_create(&self, uri: &str, domain: &str, snapshot: &str) -> Result<()>;

    async fn domain_snapshot_revert(&self, uri: &str, domain: &str, snapshot: &str) -> Result<()>;

    async fn domain_snapshot_delete(&self, uri: &str, domain: &str, snapshot: &str) -> Result<()>;

    async fn domain_targethost_add(&self, uri: &str, domain: &str, targethost: &str) -> Result<()>;

    async fn domain_targethost_remove(&self, uri: &str, domain: &str, targethost: &str) -> Result<()>;
}

/// Storage pool and volume management.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn storage_pools(&self, uri: &str) -> Result<Vec<StoragePool>>;

    /// Volumes of a pool, optionally restricted to a device kind (`disk`, `cdrom`).
    async fn storage_volumes(&self, uri: &str, pool: &str, device: Option<&str>) -> Result<Vec<StorageVolume>>;

    /// Delete volumes given by path.
    async fn storage_volumes_destroy(&self, uri: &str, volumes: &[String]) -> Result<()>;

    /// `(node uri, domain uuid)` pairs of every domain using the volume.
    async fn storage_volume_used_by(&self, volume: &str) -> Result<Vec<(String, String)>>;
}
