//! Recording collaborator double shared by the dispatcher tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vmmd_hypervisor::error::Result;
use vmmd_hypervisor::{CloneSubstitutions, NodeBackend, NodeError, StorageBackend};
use vmmd_node::Server;
use vmmd_proto::{
    ConnectionHandle, DefineOutcome, Domain, DomainSummary, GroupSnapshot, NodeSnapshot,
    StoragePool, StorageVolume, TargetState,
};

/// Records every collaborator call; can be primed to fail or to hang.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<NodeError>>,
    hang: AtomicBool,
    snapshot: Mutex<Option<NodeSnapshot>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following call fail with `err`.
    pub fn fail_with(&self, err: NodeError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    /// Make every following call block forever.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Snapshot returned by `node_query`.
    pub fn set_snapshot(&self, snapshot: Option<NodeSnapshot>) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        let failure = self.failure.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// A server whose node and storage collaborators are both `backend`.
pub fn server_with(backend: &Arc<RecordingBackend>) -> Server {
    Server::new(backend.clone(), backend.clone())
}

/// A snapshot of a reachable node.
pub fn connected_snapshot(uri: &str) -> NodeSnapshot {
    NodeSnapshot {
        name: "h1".to_string(),
        uri: uri.to_string(),
        conn: Some(ConnectionHandle::new(1)),
        ..Default::default()
    }
}

#[async_trait]
impl NodeBackend for RecordingBackend {
    async fn node_add(&self, uri: &str) -> Result<()> {
        self.enter(format!("node_add({uri})")).await
    }

    async fn node_remove(&self, uri: &str) -> Result<()> {
        self.enter(format!("node_remove({uri})")).await
    }

    async fn node_query(&self, uri: &str) -> Result<Option<Arc<NodeSnapshot>>> {
        self.enter(format!("node_query({uri})")).await?;
        Ok(self.snapshot.lock().unwrap().clone().map(Arc::new))
    }

    async fn node_frequency(&self, hz: u64, uri: Option<&str>) -> Result<()> {
        self.enter(format!("node_frequency({hz}, {uri:?})")).await
    }

    async fn node_list(&self, group: &str, pattern: &str) -> Result<Vec<Arc<NodeSnapshot>>> {
        self.enter(format!("node_list({group}, {pattern})")).await?;
        Ok(Vec::new())
    }

    async fn group_list(&self) -> Result<Vec<GroupSnapshot>> {
        self.enter("group_list()".to_string()).await?;
        Ok(Vec::new())
    }

    async fn domain_list(&self, uri: &str, pattern: &str) -> Result<BTreeMap<String, Vec<DomainSummary>>> {
        self.enter(format!("domain_list({uri}, {pattern})")).await?;
        Ok(BTreeMap::new())
    }

    async fn domain_info(&self, uri: &str, domain: &str) -> Result<Domain> {
        self.enter(format!("domain_info({uri}, {domain})")).await?;
        Ok(Domain::new(domain))
    }

    async fn domain_define(&self, uri: &str, domain: Domain) -> Result<DefineOutcome> {
        self.enter(format!("domain_define({uri}, {})", domain.name)).await?;
        Ok(DefineOutcome {
            uuid: "00000000-0000-4000-8000-000000000001".to_string(),
            warnings: vec!["pool \"fast\" not found".to_string()],
        })
    }

    async fn domain_state(&self, uri: &str, domain: &str, state: TargetState) -> Result<()> {
        self.enter(format!("domain_state({uri}, {domain}, {})", state.as_str())).await
    }

    async fn domain_save(&self, uri: &str, domain: &str, statefile: &str) -> Result<()> {
        self.enter(format!("domain_save({uri}, {domain}, {statefile})")).await
    }

    async fn domain_restore(&self, uri: &str, statefile: &str) -> Result<()> {
        self.enter(format!("domain_restore({uri}, {statefile})")).await
    }

    async fn domain_undefine(&self, uri: &str, domain: &str, volumes: Option<&[String]>) -> Result<()> {
        self.enter(format!("domain_undefine({uri}, {domain}, {volumes:?})")).await
    }

    async fn domain_migrate(&self, uri: &str, domain: &str, target_uri: &str) -> Result<()> {
        self.enter(format!("domain_migrate({uri}, {domain}, {target_uri})")).await
    }

    async fn domain_update(&self, domain: &str) -> Result<()> {
        self.enter(format!("domain_update({domain})")).await
    }

    async fn domain_clone(
        &self,
        uri: &str,
        domain: &str,
        name: &str,
        subst: &CloneSubstitutions,
    ) -> Result<DefineOutcome> {
        self.enter(format!("domain_clone({uri}, {domain}, {name}, {subst:?})")).await?;
        Ok(DefineOutcome {
            uuid: "00000000-0000-4000-8000-000000000002".to_string(),
            warnings: Vec::new(),
        })
    }

    async fn domain_snapshot_create(&self, uri: &str, domain: &str, snapshot: &str) -> Result<()> {
        self.enter(format!("domain_snapshot_create({uri}, {domain}, {snapshot})")).await
    }

    async fn domain_snapshot_revert(&self, uri: &str, domain: &str, snapshot: &str) -> Result<()> {
        self.enter(format!("domain_snapshot_revert({uri}, {domain}, {snapshot})")).await
    }

    async fn domain_snapshot_delete(&self, uri: &str, domain: &str, snapshot: &str) -> Result<()> {
        self.enter(format!("domain_snapshot_delete({uri}, {domain}, {snapshot})")).await
    }

    async fn domain_targethost_add(&self, uri: &str, domain: &str, targethost: &str) -> Result<()> {
        self.enter(format!("domain_targethost_add({uri}, {domain}, {targethost})")).await
    }

    async fn domain_targethost_remove(&self, uri: &str, domain: &str, targethost: &str) -> Result<()> {
        self.enter(format!("domain_targethost_remove({uri}, {domain}, {targethost})")).await
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    async fn storage_pools(&self, uri: &str) -> Result<Vec<StoragePool>> {
        self.enter(format!("storage_pools({uri})")).await?;
        Ok(Vec::new())
    }

    async fn storage_volumes(&self, uri: &str, pool: &str, device: Option<&str>) -> Result<Vec<StorageVolume>> {
        self.enter(format!("storage_volumes({uri}, {pool}, {device:?})")).await?;
        Ok(Vec::new())
    }

    async fn storage_volumes_destroy(&self, uri: &str, volumes: &[String]) -> Result<()> {
        self.enter(format!("storage_volumes_destroy({uri}, {volumes:?})")).await
    }

    async fn storage_volume_used_by(&self, volume: &str) -> Result<Vec<(String, String)>> {
        self.enter(format!("storage_volume_used_by({volume})")).await?;
        Ok(vec![("qemu://h1/system".to_string(), "uuid-1".to_string())])
    }
}
