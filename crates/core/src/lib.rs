//! Quilt core types: profiles, resources and the shapes shared by the resolver,
//! composer and engine crates.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod normalize;

pub use normalize::{ConfigParseError, ConfigParser};

pub type ProfileId = i64;
pub type ResourceId = i64;

/// Profile types are scoped per resource kind; a store fetch is always for one type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    PodProfile,
    PodMetadataProfile,
    ContainerProfile,
    ServiceProfile,
    ServiceMetadataProfile,
    ServiceSelectorProfile,
    DeploymentProfile,
    DeploymentMetadataProfile,
    DeploymentSelectorProfile,
}

impl ProfileType {
    pub const ALL: [ProfileType; 9] = [
        ProfileType::PodProfile,
        ProfileType::PodMetadataProfile,
        ProfileType::ContainerProfile,
        ProfileType::ServiceProfile,
        ProfileType::ServiceMetadataProfile,
        ProfileType::ServiceSelectorProfile,
        ProfileType::DeploymentProfile,
        ProfileType::DeploymentMetadataProfile,
        ProfileType::DeploymentSelectorProfile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::PodProfile => "pod_profile",
            ProfileType::PodMetadataProfile => "pod_metadata_profile",
            ProfileType::ContainerProfile => "container_profile",
            ProfileType::ServiceProfile => "service_profile",
            ProfileType::ServiceMetadataProfile => "service_metadata_profile",
            ProfileType::ServiceSelectorProfile => "service_selector_profile",
            ProfileType::DeploymentProfile => "deployment_profile",
            ProfileType::DeploymentMetadataProfile => "deployment_metadata_profile",
            ProfileType::DeploymentSelectorProfile => "deployment_selector_profile",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown profile type: {0}")]
pub struct UnknownProfileType(pub String);

impl FromStr for ProfileType {
    type Err = UnknownProfileType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProfileType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownProfileType(s.to_string()))
    }
}

/// A stored, reusable configuration fragment. Read-only at composition time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: ProfileId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub profile_type: ProfileType,
    #[serde(default)]
    pub namespace: String,
    /// Either a structured value or a string holding encoded JSON.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The resource kinds the engine knows how to compose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Container,
    Service,
    Deployment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Container => "container",
            ResourceKind::Service => "service",
            ResourceKind::Deployment => "deployment",
        }
    }

    /// Profile type every dynamic attribute of this kind resolves to.
    pub fn dynamic_profile_type(&self) -> ProfileType {
        match self {
            ResourceKind::Pod => ProfileType::PodProfile,
            ResourceKind::Container => ProfileType::ContainerProfile,
            ResourceKind::Service => ProfileType::ServiceProfile,
            ResourceKind::Deployment => ProfileType::DeploymentProfile,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0} (expect pod, container, service or deployment)")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pod" => Ok(ResourceKind::Pod),
            "container" => Ok(ResourceKind::Container),
            "service" => Ok(ResourceKind::Service),
            "deployment" => Ok(ResourceKind::Deployment),
            _ => Err(UnknownResourceKind(s.to_string())),
        }
    }
}

/// Caller-chosen attribute key -> profile id. Keys are unique; a repeated key
/// replaces the previous id. Iteration is in key order, which keeps composed
/// output stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DynamicAttrs(BTreeMap<String, ProfileId>);

impl DynamicAttrs {
    pub fn new() -> Self { Self::default() }

    /// Attach `id` under `key`, returning the id previously attached there.
    pub fn insert(&mut self, key: impl Into<String>, id: ProfileId) -> Option<ProfileId> {
        self.0.insert(key.into(), id)
    }

    pub fn remove(&mut self, key: &str) -> Option<ProfileId> { self.0.remove(key) }
    pub fn get(&self, key: &str) -> Option<ProfileId> { self.0.get(key).copied() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ProfileId)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, ProfileId)> for DynamicAttrs {
    fn from_iter<I: IntoIterator<Item = (K, ProfileId)>>(iter: I) -> Self {
        let mut attrs = DynamicAttrs::new();
        for (k, id) in iter {
            attrs.insert(k, id);
        }
        attrs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<bool>,
    #[serde(default, skip_serializing_if = "DynamicAttrs::is_empty")]
    pub dynamic_attr: DynamicAttrs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pod {
    pub id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    /// Embedded container ids; order is significant and preserved.
    #[serde(default)]
    pub containers: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_profile_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "DynamicAttrs::is_empty")]
    pub dynamic_attr: DynamicAttrs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_profile_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "DynamicAttrs::is_empty")]
    pub dynamic_attr: DynamicAttrs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_profile_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "DynamicAttrs::is_empty")]
    pub dynamic_attr: DynamicAttrs,
}

/// Any composable resource, as handed out by a resource store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resource {
    Pod(Pod),
    Container(Container),
    Service(Service),
    Deployment(Deployment),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Pod(_) => ResourceKind::Pod,
            Resource::Container(_) => ResourceKind::Container,
            Resource::Service(_) => ResourceKind::Service,
            Resource::Deployment(_) => ResourceKind::Deployment,
        }
    }

    pub fn id(&self) -> ResourceId {
        match self {
            Resource::Pod(r) => r.id,
            Resource::Container(r) => r.id,
            Resource::Service(r) => r.id,
            Resource::Deployment(r) => r.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Pod(r) => &r.name,
            Resource::Container(r) => &r.name,
            Resource::Service(r) => &r.name,
            Resource::Deployment(r) => &r.name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Resource::Pod(r) => &r.namespace,
            Resource::Container(r) => &r.namespace,
            Resource::Service(r) => &r.namespace,
            Resource::Deployment(r) => &r.namespace,
        }
    }

    pub fn dynamic_attr(&self) -> &DynamicAttrs {
        match self {
            Resource::Pod(r) => &r.dynamic_attr,
            Resource::Container(r) => &r.dynamic_attr,
            Resource::Service(r) => &r.dynamic_attr,
            Resource::Deployment(r) => &r.dynamic_attr,
        }
    }
}

/// A resource whose shape cannot be composed (caller bug, not user data).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} {id}: {reason}")]
pub struct ShapeError {
    pub kind: ResourceKind,
    pub id: ResourceId,
    pub reason: String,
}

/// Structural checks shared by every kind: a name, and non-empty attribute keys.
pub fn check_shape(kind: ResourceKind, id: ResourceId, name: &str, attrs: &DynamicAttrs) -> Result<(), ShapeError> {
    if name.trim().is_empty() {
        return Err(ShapeError { kind, id, reason: "name is empty".into() });
    }
    if attrs.iter().any(|(k, _)| k.trim().is_empty()) {
        return Err(ShapeError { kind, id, reason: "dynamic attribute key is empty".into() });
    }
    Ok(())
}

/// Profile paired with its normalized config.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    pub profile: Profile,
    pub parsed: Result<serde_json::Value, ConfigParseError>,
}

impl ResolvedProfile {
    pub fn new(profile: Profile, parser: &ConfigParser) -> Self {
        let parsed = parser.normalize(&profile.config);
        Self { profile, parsed }
    }
}

/// Outcome of looking up one referenced profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    Resolved(&'a ResolvedProfile),
    /// Referenced but absent from the store (dangling), or not referenced at all.
    Unresolved,
}

impl<'a> Resolution<'a> {
    pub fn is_resolved(&self) -> bool { matches!(self, Resolution::Resolved(_)) }

    pub fn profile(&self) -> Option<&'a ResolvedProfile> {
        match self {
            Resolution::Resolved(p) => Some(p),
            Resolution::Unresolved => None,
        }
    }
}

pub mod prelude {
    pub use super::{
        Container, Deployment, DynamicAttrs, Pod, Profile, ProfileId, ProfileType, Resolution,
        ResolvedProfile, Resource, ResourceId, ResourceKind, Service,
    };
}
