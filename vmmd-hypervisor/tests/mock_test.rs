//! Integration tests for the mock node collaborator.

use std::sync::Arc;

use vmmd_hypervisor::{MockBackend, NodeBackend, NodeErrorKind, ParserOptions, StorageBackend};
use vmmd_proto::{DomainState, TargetState};

const URI: &str = "xen://xen1.example.com/";
const XEN_HVM: &str = include_str!("fixtures/xen_hvm.xml");
const XEN_PV_KERNEL: &str = include_str!("fixtures/xen_pv_kernel.xml");
const MALFORMED: &str = include_str!("fixtures/malformed.xml");

fn backend() -> MockBackend {
    MockBackend::with_options(ParserOptions::new("x86_64", "en-us"))
}

/// A poll over a mix of good and broken descriptors keeps the good ones.
#[tokio::test]
async fn test_poll_skips_malformed_descriptors() {
    let backend = backend();
    backend.node_add(URI).await.unwrap();
    backend.inject_descriptor(URI, "hvm", XEN_HVM).unwrap();
    backend.inject_descriptor(URI, "broken", MALFORMED).unwrap();
    backend.inject_descriptor(URI, "pv", XEN_PV_KERNEL).unwrap();

    backend.poll(URI).unwrap();
    let node = backend.node_query(URI).await.unwrap().unwrap();

    let names: Vec<_> = node.domains.values().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["win2k8", "pv-kernel"]);
    assert_eq!(node.name, "xen1.example.com");
    assert!(node.capabilities.iter().all(|t| t.domain_type == "xen"));
}

/// Injected Xen guests follow the same state machine as defined ones.
#[tokio::test]
async fn test_injected_domain_lifecycle() {
    let backend = backend();
    backend.node_add(URI).await.unwrap();
    backend.inject_descriptor(URI, "pv", XEN_PV_KERNEL).unwrap();

    backend.domain_state(URI, "pv", TargetState::Run).await.unwrap();
    let node = backend.node_query(URI).await.unwrap().unwrap();
    assert_eq!(node.domains["pv"].state, DomainState::Running);
    assert_eq!(node.cur_mem, 256 * 1024 * 1024);

    backend.domain_state(URI, "pv", TargetState::Restart).await.unwrap();
    backend.domain_state(URI, "pv", TargetState::Pause).await.unwrap();
    let err = backend
        .domain_state(URI, "pv", TargetState::Restart)
        .await
        .unwrap_err();
    assert_eq!(err.kind, NodeErrorKind::InvalidState);
}

/// Readers never see a snapshot torn between two polls.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_see_whole_snapshots() {
    let backend = Arc::new(backend());
    backend.node_add(URI).await.unwrap();
    backend.inject_descriptor(URI, "hvm", XEN_HVM).unwrap();

    let writer = {
        let backend = backend.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let state = if i % 2 == 0 { TargetState::Run } else { TargetState::Shutdown };
                backend.domain_state(URI, "hvm", state).await.unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let backend = backend.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..200 {
                let node = backend.node_query(URI).await.unwrap().unwrap();
                let domain = &node.domains["hvm"];
                let expected = if domain.state.is_active() { domain.cur_mem } else { 0 };
                assert_eq!(node.cur_mem, expected);
                tokio::task::yield_now().await;
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test]
async fn test_storage_of_unreachable_node() {
    let backend = backend();
    backend.node_add(URI).await.unwrap();
    assert_eq!(backend.storage_pools(URI).await.unwrap().len(), 1);

    backend.set_reachable(URI, false).unwrap();
    let err = backend.storage_pools(URI).await.unwrap_err();
    assert_eq!(err.kind, NodeErrorKind::Unavailable);
}
