#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quilt_core::{ConfigParser, Profile, ProfileType};
use quilt_resolve::{ProfileRequest, ProfileResolver, ResolveError};
use quilt_store::{MemoryStore, ProfileStore};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

fn profile(id: i64, t: ProfileType, config: serde_json::Value) -> Profile {
    Profile { id, name: String::new(), profile_type: t, namespace: "default".into(), config }
}

/// Records every batch it serves and forwards to a MemoryStore.
struct CountingStore {
    inner: MemoryStore,
    calls: Mutex<Vec<(ProfileType, Vec<i64>)>>,
}

#[async_trait::async_trait]
impl ProfileStore for CountingStore {
    async fn fetch_by_ids(&self, t: ProfileType, ids: &BTreeSet<i64>, ns: &str) -> anyhow::Result<Vec<Profile>> {
        self.calls.lock().unwrap().push((t, ids.iter().copied().collect()));
        self.inner.fetch_by_ids(t, ids, ns).await
    }
}

#[tokio::test]
async fn one_batch_per_type_with_deduplicated_ids() {
    let inner = MemoryStore::new();
    inner.upsert_profile(profile(1, ProfileType::ContainerProfile, serde_json::json!({"cpu": "1"})));
    inner.upsert_profile(profile(2, ProfileType::PodMetadataProfile, serde_json::json!({"labels": {}})));
    let store = CountingStore { inner, calls: Mutex::new(Vec::new()) };

    let mut req = ProfileRequest::new();
    req.add(ProfileType::ContainerProfile, 1);
    req.add(ProfileType::ContainerProfile, 1);
    req.add(ProfileType::ContainerProfile, 3);
    req.add(ProfileType::PodMetadataProfile, 2);

    let resolver = ProfileResolver::new(&store, ConfigParser::strict());
    let out = resolver.resolve(&req, "default").await.unwrap();

    let calls = store.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&(ProfileType::ContainerProfile, vec![1, 3])));
    assert!(calls.contains(&(ProfileType::PodMetadataProfile, vec![2])));
    assert_eq!(out.len(), 2);
    assert_eq!(out.unresolved().collect::<Vec<_>>(), vec![(ProfileType::ContainerProfile, 3)]);
}

#[tokio::test]
async fn malformed_config_is_resolved_with_parse_error() {
    let store = MemoryStore::new();
    store.upsert_profile(profile(4, ProfileType::ContainerProfile, serde_json::json!("{not json")));
    let mut req = ProfileRequest::new();
    req.add(ProfileType::ContainerProfile, 4);

    let out = ProfileResolver::new(&store, ConfigParser::strict()).resolve(&req, "default").await.unwrap();
    let rp = out.lookup(ProfileType::ContainerProfile, 4).profile().unwrap();
    assert_eq!(rp.parsed.as_ref().unwrap_err().raw, "{not json");
    assert_eq!(out.parse_failures(), 1);
}

/// Each batch waits on a shared barrier, so sequential fetching would hang.
struct BarrierStore {
    barrier: Barrier,
}

#[async_trait::async_trait]
impl ProfileStore for BarrierStore {
    async fn fetch_by_ids(&self, t: ProfileType, ids: &BTreeSet<i64>, _ns: &str) -> anyhow::Result<Vec<Profile>> {
        self.barrier.wait().await;
        Ok(ids.iter().map(|id| profile(*id, t, serde_json::json!({}))).collect())
    }
}

#[tokio::test]
async fn batches_for_different_types_run_concurrently() {
    let store = BarrierStore { barrier: Barrier::new(3) };
    let mut req = ProfileRequest::new();
    req.add(ProfileType::DeploymentSelectorProfile, 1);
    req.add(ProfileType::DeploymentMetadataProfile, 2);
    req.add(ProfileType::DeploymentProfile, 3);

    let resolver = ProfileResolver::new(&store, ConfigParser::strict());
    let out = tokio::time::timeout(Duration::from_secs(2), resolver.resolve(&req, "default"))
        .await
        .expect("batches were fetched one after another")
        .unwrap();
    assert_eq!(out.len(), 3);
}

/// Fails one type and counts how many batches were attempted.
struct FlakyStore {
    attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl ProfileStore for FlakyStore {
    async fn fetch_by_ids(&self, t: ProfileType, ids: &BTreeSet<i64>, _ns: &str) -> anyhow::Result<Vec<Profile>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if t == ProfileType::PodProfile {
            anyhow::bail!("connection reset");
        }
        Ok(ids.iter().map(|id| profile(*id, t, serde_json::json!({}))).collect())
    }
}

#[tokio::test]
async fn store_failure_waits_for_all_batches() {
    let store = FlakyStore { attempts: AtomicUsize::new(0) };
    let mut req = ProfileRequest::new();
    req.add(ProfileType::PodProfile, 1);
    req.add(ProfileType::PodMetadataProfile, 2);
    req.add(ProfileType::ContainerProfile, 3);

    let err = ProfileResolver::new(&store, ConfigParser::strict()).resolve(&req, "default").await.unwrap_err();
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    match err {
        ResolveError::Store { profile_type, message } => {
            assert_eq!(profile_type, ProfileType::PodProfile);
            assert!(message.contains("connection reset"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Ignores the requested type, as a buggy backend might.
struct UntypedStore;

#[async_trait::async_trait]
impl ProfileStore for UntypedStore {
    async fn fetch_by_ids(&self, _t: ProfileType, ids: &BTreeSet<i64>, _ns: &str) -> anyhow::Result<Vec<Profile>> {
        Ok(ids.iter().map(|id| profile(*id, ProfileType::ServiceProfile, serde_json::json!({}))).collect())
    }
}

#[tokio::test]
async fn type_mismatch_is_an_error() {
    let mut req = ProfileRequest::new();
    req.add(ProfileType::ServiceSelectorProfile, 9);
    let err = ProfileResolver::new(&UntypedStore, ConfigParser::strict()).resolve(&req, "default").await.unwrap_err();
    assert!(matches!(
        err,
        ResolveError::TypeMismatch { id: 9, expected: ProfileType::ServiceSelectorProfile, found: ProfileType::ServiceProfile }
    ));
}

#[tokio::test]
async fn id_stored_under_another_type_is_a_mismatch() {
    let store = MemoryStore::new();
    store.upsert_profile(profile(5, ProfileType::ContainerProfile, serde_json::json!({"labels": {"tier": "web"}})));
    let mut req = ProfileRequest::new();
    req.add(ProfileType::PodMetadataProfile, 5);
    let err = ProfileResolver::new(&store, ConfigParser::strict()).resolve(&req, "default").await.unwrap_err();
    assert!(matches!(
        err,
        ResolveError::TypeMismatch { id: 5, expected: ProfileType::PodMetadataProfile, found: ProfileType::ContainerProfile }
    ));
}

#[tokio::test]
async fn missing_or_foreign_namespace_ids_stay_dangling() {
    let store = MemoryStore::new();
    let mut other_ns = profile(6, ProfileType::ContainerProfile, serde_json::json!({}));
    other_ns.namespace = "prod".into();
    store.upsert_profile(other_ns);
    let mut req = ProfileRequest::new();
    req.add(ProfileType::PodMetadataProfile, 6);
    req.add(ProfileType::PodMetadataProfile, 404);
    let out = ProfileResolver::new(&store, ConfigParser::strict()).resolve(&req, "default").await.unwrap();
    assert!(out.is_empty());
    let misses: Vec<_> = out.unresolved().collect();
    assert_eq!(misses, vec![(ProfileType::PodMetadataProfile, 6), (ProfileType::PodMetadataProfile, 404)]);
}

struct PendingStore;

#[async_trait::async_trait]
impl ProfileStore for PendingStore {
    async fn fetch_by_ids(&self, _t: ProfileType, _ids: &BTreeSet<i64>, _ns: &str) -> anyhow::Result<Vec<Profile>> {
        futures::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn cancellation_stops_waiting_on_the_store() {
    let mut req = ProfileRequest::new();
    req.add(ProfileType::PodProfile, 1);
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.cancel();
    });
    let resolver = ProfileResolver::new(&PendingStore, ConfigParser::strict());
    let err = resolver.resolve_with_cancel(&req, "default", &token).await.unwrap_err();
    assert!(matches!(err, ResolveError::Cancelled));
}

#[tokio::test]
async fn empty_request_touches_nothing() {
    let store = Arc::new(FlakyStore { attempts: AtomicUsize::new(0) });
    let out = ProfileResolver::new(store.as_ref(), ConfigParser::strict())
        .resolve(&ProfileRequest::new(), "default")
        .await
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(store.attempts.load(Ordering::SeqCst), 0);
}
