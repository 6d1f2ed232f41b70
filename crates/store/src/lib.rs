//! Quilt store: the collaborator seams the engine reads from, plus an in-RAM
//! implementation used by the CLI and tests.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use quilt_core::{Container, Deployment, Pod, Profile, ProfileId, ProfileType, Resource, ResourceId, ResourceKind, Service};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Batch access to stored profiles. Fetches are scoped to one profile type.
///
/// Implementations return only profiles that exist; unknown ids are silently
/// omitted from the result.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch_by_ids(
        &self,
        profile_type: ProfileType,
        ids: &BTreeSet<ProfileId>,
        namespace: &str,
    ) -> Result<Vec<Profile>>;

    /// Types of the given ids in `namespace`, whatever type they were
    /// referenced under. Unknown ids are omitted. Used to tell a reference of
    /// the wrong type apart from a dangling one; stores that cannot answer
    /// report nothing, which makes every miss look dangling.
    async fn profile_types(
        &self,
        _ids: &BTreeSet<ProfileId>,
        _namespace: &str,
    ) -> Result<Vec<(ProfileId, ProfileType)>> {
        Ok(Vec::new())
    }
}

/// Batch access to stored resources, used to load embedded sub-resources.
/// Same contract as [`ProfileStore`]: unknown ids are omitted.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn fetch_resources(
        &self,
        kind: ResourceKind,
        ids: &[ResourceId],
        namespace: &str,
    ) -> Result<Vec<Resource>>;
}

/// Serializable set of profiles and resources (fixture files, seeding).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

impl Catalog {
    /// Parse a catalog from JSON or YAML text.
    pub fn from_str_any(text: &str) -> Result<Self> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            serde_json::from_str(text).context("parsing JSON catalog")
        } else {
            serde_yaml::from_str(text).context("parsing YAML catalog")
        }
    }

    pub fn resources(self) -> impl Iterator<Item = Resource> {
        self.pods.into_iter().map(Resource::Pod)
            .chain(self.containers.into_iter().map(Resource::Container))
            .chain(self.services.into_iter().map(Resource::Service))
            .chain(self.deployments.into_iter().map(Resource::Deployment))
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    epoch: u64,
    profiles: FxHashMap<ProfileId, Profile>,
    resources: FxHashMap<(ResourceKind, ResourceId), Resource>,
}

/// In-RAM store. Readers see an immutable snapshot; every write swaps in a new
/// one, so a composition in flight is never affected by a concurrent edit.
pub struct MemoryStore {
    snap: ArcSwap<Snapshot>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self { Self { snap: ArcSwap::from_pointee(Snapshot::default()) } }

    pub fn from_catalog(catalog: Catalog) -> Self {
        let mut snap = Snapshot::default();
        for p in catalog.profiles.iter().cloned() {
            snap.profiles.insert(p.id, p);
        }
        for r in catalog.resources() {
            snap.resources.insert((r.kind(), r.id()), r);
        }
        info!(profiles = snap.profiles.len(), resources = snap.resources.len(), "memory store seeded");
        Self { snap: ArcSwap::from_pointee(snap) }
    }

    /// Load a fixture catalog from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
        let catalog = Catalog::from_str_any(&text).with_context(|| format!("loading catalog {}", path.display()))?;
        Ok(Self::from_catalog(catalog))
    }

    /// Number of writes applied since creation.
    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    pub fn upsert_profile(&self, profile: Profile) {
        self.write(|s| { s.profiles.insert(profile.id, profile.clone()); });
    }

    pub fn remove_profile(&self, id: ProfileId) -> bool {
        let existed = self.snap.load().profiles.contains_key(&id);
        self.write(|s| { s.profiles.remove(&id); });
        existed
    }

    pub fn upsert_resource(&self, resource: Resource) {
        self.write(|s| { s.resources.insert((resource.kind(), resource.id()), resource.clone()); });
    }

    pub fn remove_resource(&self, kind: ResourceKind, id: ResourceId) -> bool {
        let existed = self.snap.load().resources.contains_key(&(kind, id));
        self.write(|s| { s.resources.remove(&(kind, id)); });
        existed
    }

    /// All profiles ordered by id.
    pub fn profiles(&self) -> Vec<Profile> {
        let snap = self.snap.load();
        let mut out: Vec<Profile> = snap.profiles.values().cloned().collect();
        out.sort_by_key(|p| p.id);
        out
    }

    /// All resources ordered by kind, then id.
    pub fn resources(&self) -> Vec<Resource> {
        let snap = self.snap.load();
        let mut out: Vec<Resource> = snap.resources.values().cloned().collect();
        out.sort_by_key(|r| (r.kind(), r.id()));
        out
    }

    fn write(&self, f: impl Fn(&mut Snapshot)) {
        self.snap.rcu(|cur| {
            let mut next = Snapshot::clone(cur);
            f(&mut next);
            next.epoch = next.epoch.saturating_add(1);
            Arc::new(next)
        });
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryStore {
    async fn fetch_by_ids(
        &self,
        profile_type: ProfileType,
        ids: &BTreeSet<ProfileId>,
        namespace: &str,
    ) -> Result<Vec<Profile>> {
        let snap = self.snap.load();
        let out: Vec<Profile> = ids
            .iter()
            .filter_map(|id| snap.profiles.get(id))
            .filter(|p| p.profile_type == profile_type && p.namespace == namespace)
            .cloned()
            .collect();
        debug!(profile_type = %profile_type, ns = %namespace, requested = ids.len(), found = out.len(), "memory store: profiles fetched");
        metrics::histogram!("store_fetch_items", out.len() as f64);
        Ok(out)
    }

    async fn profile_types(
        &self,
        ids: &BTreeSet<ProfileId>,
        namespace: &str,
    ) -> Result<Vec<(ProfileId, ProfileType)>> {
        let snap = self.snap.load();
        Ok(ids
            .iter()
            .filter_map(|id| snap.profiles.get(id))
            .filter(|p| p.namespace == namespace)
            .map(|p| (p.id, p.profile_type))
            .collect())
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn fetch_resources(
        &self,
        kind: ResourceKind,
        ids: &[ResourceId],
        namespace: &str,
    ) -> Result<Vec<Resource>> {
        let snap = self.snap.load();
        let out: Vec<Resource> = ids
            .iter()
            .filter_map(|id| snap.resources.get(&(kind, *id)))
            .filter(|r| r.namespace() == namespace)
            .cloned()
            .collect();
        debug!(kind = %kind, ns = %namespace, requested = ids.len(), found = out.len(), "memory store: resources fetched");
        Ok(out)
    }
}
