//! Quilt composition engine facade (in-process).
//!
//! One entry point per resource kind. Each call loads the embedded
//! sub-resources, resolves every referenced profile in a single batched pass,
//! then composes bottom-up. Data problems (dangling ids, malformed configs)
//! end up inside the returned manifest; only caller errors fail the call.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use quilt_compose::Composer;
use quilt_core::{check_shape, ConfigParser, Container, Pod, ProfileId, ResourceId, ResourceKind, Service, ShapeError, UnknownResourceKind};
use quilt_resolve::{ProfileRequest, ProfileResolver, ResolveError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod adapters;
mod config;

use adapters::{Adapter, DeploymentTree, PodTree};

pub use config::EngineConfig;
pub use quilt_compose::{ComposedManifest, MergeError, RenderError};
pub use quilt_core::{Deployment, ProfileType, Resource};
pub use quilt_store::{MemoryStore, ProfileStore, ResourceStore};

/// Errors that mean the caller asked for something that cannot be composed.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error(transparent)]
    InvalidResourceKind(#[from] UnknownResourceKind),
    #[error("invalid resource: {0}")]
    InvalidResource(#[from] ShapeError),
    #[error("{kind} {id} not found in namespace {namespace:?}")]
    ResourceNotFound { kind: ResourceKind, id: ResourceId, namespace: String },
    #[error("profile {id} has type {found}, expected {expected}")]
    ProfileTypeMismatch { id: ProfileId, expected: ProfileType, found: ProfileType },
    #[error("store: {0}")]
    Store(String),
    #[error("composition cancelled")]
    Cancelled,
    #[error("composition timed out after {0:?}")]
    Timeout(Duration),
    #[error("{kind} {id}: embedding deeper than {max} levels")]
    EmbeddingTooDeep { kind: ResourceKind, id: ResourceId, max: usize },
    #[error("merge: {0}")]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl From<ResolveError> for ComposeError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Store { .. } => ComposeError::Store(e.to_string()),
            ResolveError::TypeMismatch { id, expected, found } => ComposeError::ProfileTypeMismatch { id, expected, found },
            ResolveError::Cancelled => ComposeError::Cancelled,
        }
    }
}

pub type ComposeResult<T> = Result<T, ComposeError>;

/// What to compose: a resource held by the caller, or one looked up by id.
#[derive(Debug, Clone, Copy)]
pub enum ComposeTarget<'a> {
    Pod(&'a Pod),
    Container(&'a Container),
    Service(&'a Service),
    Deployment(&'a Deployment),
    ById { kind: ResourceKind, id: ResourceId, namespace: &'a str },
}

impl ComposeTarget<'_> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ComposeTarget::Pod(_) => ResourceKind::Pod,
            ComposeTarget::Container(_) => ResourceKind::Container,
            ComposeTarget::Service(_) => ResourceKind::Service,
            ComposeTarget::Deployment(_) => ResourceKind::Deployment,
            ComposeTarget::ById { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> ResourceId {
        match self {
            ComposeTarget::Pod(p) => p.id,
            ComposeTarget::Container(c) => c.id,
            ComposeTarget::Service(s) => s.id,
            ComposeTarget::Deployment(d) => d.id,
            ComposeTarget::ById { id, .. } => *id,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ComposeTarget::Pod(p) => &p.namespace,
            ComposeTarget::Container(c) => &c.namespace,
            ComposeTarget::Service(s) => &s.namespace,
            ComposeTarget::Deployment(d) => &d.namespace,
            ComposeTarget::ById { namespace, .. } => namespace,
        }
    }
}

enum Tree {
    Container(Container),
    Pod(PodTree),
    Service(Service),
    Deployment(DeploymentTree),
}

impl Tree {
    fn adapter(&self) -> &dyn Adapter {
        match self {
            Tree::Container(c) => c,
            Tree::Pod(p) => p,
            Tree::Service(s) => s,
            Tree::Deployment(d) => d,
        }
    }
}

/// Stateless between calls; safe to share across tasks.
pub struct CompositionEngine<S: ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
    composer: Composer,
    parser: ConfigParser,
}

impl<S> CompositionEngine<S>
where
    S: ProfileStore + ResourceStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let composer = Composer::new(config.composer_options());
        let parser = config.parser();
        Self { store, config, composer, parser }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub async fn compose_pod(&self, pod: &Pod) -> ComposeResult<ComposedManifest> {
        self.compose_with_cancel(ComposeTarget::Pod(pod), &CancellationToken::new()).await
    }

    pub async fn compose_container(&self, container: &Container) -> ComposeResult<ComposedManifest> {
        self.compose_with_cancel(ComposeTarget::Container(container), &CancellationToken::new()).await
    }

    pub async fn compose_service(&self, service: &Service) -> ComposeResult<ComposedManifest> {
        self.compose_with_cancel(ComposeTarget::Service(service), &CancellationToken::new()).await
    }

    pub async fn compose_deployment(&self, deployment: &Deployment) -> ComposeResult<ComposedManifest> {
        self.compose_with_cancel(ComposeTarget::Deployment(deployment), &CancellationToken::new()).await
    }

    /// Compose a stored resource named by kind (`pod`, `container`, `service`, `deployment`).
    pub async fn compose(&self, kind: &str, id: ResourceId, namespace: &str) -> ComposeResult<ComposedManifest> {
        let kind: ResourceKind = kind.parse()?;
        self.compose_with_cancel(ComposeTarget::ById { kind, id, namespace }, &CancellationToken::new()).await
    }

    /// Compose and render as insertion-ordered YAML.
    pub async fn preview_yaml(&self, target: ComposeTarget<'_>) -> ComposeResult<String> {
        let m = self.compose_with_cancel(target, &CancellationToken::new()).await?;
        Ok(m.to_yaml()?)
    }

    pub async fn compose_with_cancel(
        &self,
        target: ComposeTarget<'_>,
        cancel: &CancellationToken,
    ) -> ComposeResult<ComposedManifest> {
        let compose_id = Uuid::new_v4();
        let kind = target.kind();
        let (id, ns) = (target.id(), target.namespace().to_string());
        let t0 = Instant::now();
        metrics::counter!("compose_total", 1u64, "kind" => kind.as_str());
        info!(%compose_id, kind = %kind, id, ns = %ns, "compose started");
        let res = self.run(target, cancel, compose_id).await;
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("compose_latency_ms", took_ms);
        match &res {
            Ok(m) => {
                let markers = m.error_markers().len();
                info!(%compose_id, kind = %kind, id, ns = %ns, markers, took_ms, "compose ok");
            }
            Err(e) => {
                metrics::counter!("compose_errors_total", 1u64, "kind" => kind.as_str());
                warn!(%compose_id, kind = %kind, id, ns = %ns, error = %e, took_ms, "compose failed");
            }
        }
        res
    }

    async fn run(&self, target: ComposeTarget<'_>, cancel: &CancellationToken, compose_id: Uuid) -> ComposeResult<ComposedManifest> {
        let fetch = async {
            let tree = self.load(target, cancel).await?;
            let adapter = tree.adapter();
            let mut req = ProfileRequest::new();
            adapter.collect(&mut req);
            debug!(%compose_id, kind = %adapter.kind(), profiles = req.len(), "profiles requested");
            let resolver = ProfileResolver::new(self.store.as_ref(), self.parser);
            let resolved = resolver.resolve_with_cancel(&req, adapter.namespace(), cancel).await?;
            Ok::<_, ComposeError>((tree, resolved))
        };
        let (tree, resolved) = match self.config.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch).await.map_err(|_| ComposeError::Timeout(limit))??,
            None => fetch.await?,
        };
        Ok(tree.adapter().compose(&self.composer, &resolved)?)
    }

    async fn load(&self, target: ComposeTarget<'_>, cancel: &CancellationToken) -> ComposeResult<Tree> {
        let root = match target {
            ComposeTarget::Pod(p) => Resource::Pod(p.clone()),
            ComposeTarget::Container(c) => Resource::Container(c.clone()),
            ComposeTarget::Service(s) => Resource::Service(s.clone()),
            ComposeTarget::Deployment(d) => Resource::Deployment(d.clone()),
            ComposeTarget::ById { kind, id, namespace } => {
                let mut found = self.fetch(kind, &[id], namespace, cancel).await?;
                if found.is_empty() {
                    return Err(ComposeError::ResourceNotFound { kind, id, namespace: namespace.to_string() });
                }
                found.swap_remove(0)
            }
        };
        check_shape(root.kind(), root.id(), root.name(), root.dynamic_attr())?;
        match root {
            Resource::Container(c) => Ok(Tree::Container(c)),
            Resource::Service(s) => Ok(Tree::Service(s)),
            Resource::Pod(p) => {
                let ns = p.namespace.clone();
                Ok(Tree::Pod(self.load_pod(p, &ns, 0, cancel).await?))
            }
            Resource::Deployment(d) => {
                let ns = d.namespace.clone();
                let pod = match d.pod_id {
                    Some(pod_id) => match self.fetch(ResourceKind::Pod, &[pod_id], &ns, cancel).await?.pop() {
                        Some(Resource::Pod(p)) => {
                            check_shape(ResourceKind::Pod, p.id, &p.name, &p.dynamic_attr)?;
                            Some(self.load_pod(p, &ns, 1, cancel).await?)
                        }
                        _ => {
                            warn!(deployment = %d.name, pod_id, ns = %ns, "deployment pod not found; template omitted");
                            metrics::counter!("embedded_missing_total", 1u64, "kind" => "pod");
                            None
                        }
                    },
                    None => None,
                };
                Ok(Tree::Deployment(DeploymentTree { deployment: d, pod }))
            }
        }
    }

    /// Load a pod's containers in listed order. `depth` is the pod's own
    /// embedding depth; its containers sit one level below.
    async fn load_pod(&self, pod: Pod, ns: &str, depth: usize, cancel: &CancellationToken) -> ComposeResult<PodTree> {
        self.guard_depth(ResourceKind::Pod, pod.id, depth)?;
        if pod.containers.is_empty() {
            return Ok(PodTree { pod, containers: Vec::new() });
        }
        self.guard_depth(ResourceKind::Container, pod.containers[0], depth + 1)?;
        let mut distinct: Vec<ResourceId> = Vec::with_capacity(pod.containers.len());
        for id in &pod.containers {
            if !distinct.contains(id) {
                distinct.push(*id);
            }
        }
        let fetched = self.fetch(ResourceKind::Container, &distinct, ns, cancel).await?;
        let mut containers = Vec::with_capacity(pod.containers.len());
        for id in &pod.containers {
            match fetched.iter().find(|r| r.id() == *id) {
                Some(Resource::Container(c)) => {
                    check_shape(ResourceKind::Container, c.id, &c.name, &c.dynamic_attr)?;
                    containers.push(c.clone());
                }
                _ => {
                    warn!(pod = %pod.name, container_id = *id, ns = %ns, "container not found; dropped from pod");
                    metrics::counter!("embedded_missing_total", 1u64, "kind" => "container");
                }
            }
        }
        Ok(PodTree { pod, containers })
    }

    fn guard_depth(&self, kind: ResourceKind, id: ResourceId, depth: usize) -> ComposeResult<()> {
        if depth > self.config.max_embed_depth {
            return Err(ComposeError::EmbeddingTooDeep { kind, id, max: self.config.max_embed_depth });
        }
        Ok(())
    }

    async fn fetch(&self, kind: ResourceKind, ids: &[ResourceId], ns: &str, cancel: &CancellationToken) -> ComposeResult<Vec<Resource>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ComposeError::Cancelled),
            res = self.store.fetch_resources(kind, ids, ns) => {
                res.map_err(|e| ComposeError::Store(format!("fetching {} {:?}: {:#}", kind, ids, e)))
            }
        }
    }
}
