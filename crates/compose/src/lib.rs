//! Quilt composer: merges one resource, its resolved profiles and its already
//! composed sub-resources into a single manifest document.
//!
//! Merge order for every kind:
//! 1. skeleton (`apiVersion`, `kind`, `metadata.name/namespace`, spec defaults)
//! 2. explicit scalar fields, each at a fixed path; absent values are omitted
//! 3. fixed-slot profiles as the base layer, never over an explicit path
//! 4. embedded sub-manifests (containers list, pod template)
//! 5. dynamic attributes, verbatim under the kind's attribute root
//!
//! Missing profiles leave their target untouched; malformed ones render an
//! inline `{error, raw}` marker. The composer itself has no state and does no I/O.

#![forbid(unsafe_code)]

use quilt_core::{Container, Deployment, Pod, Resolution, ResolvedProfile, ResourceKind, Service};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;
use tracing::{debug, warn};

mod manifest;

pub use manifest::{ComposedManifest, RenderError};

pub const DEFAULT_IMAGE_PLACEHOLDER: &str = "${IMAGE}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerOptions {
    /// Token written as every container image; filled in at deploy time.
    pub image_placeholder: String,
    /// Include the undecodable text in parse-error markers.
    pub include_raw: bool,
}

impl Default for ComposerOptions {
    fn default() -> Self {
        Self { image_placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(), include_raw: true }
    }
}

/// The resource being composed.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Pod(&'a Pod),
    Container(&'a Container),
    Service(&'a Service),
    Deployment(&'a Deployment),
}

impl<'a> Subject<'a> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Subject::Pod(_) => ResourceKind::Pod,
            Subject::Container(_) => ResourceKind::Container,
            Subject::Service(_) => ResourceKind::Service,
            Subject::Deployment(_) => ResourceKind::Deployment,
        }
    }

    fn name(&self) -> &'a str {
        match *self {
            Subject::Pod(r) => &r.name,
            Subject::Container(r) => &r.name,
            Subject::Service(r) => &r.name,
            Subject::Deployment(r) => &r.name,
        }
    }

    fn namespace(&self) -> &'a str {
        match *self {
            Subject::Pod(r) => &r.namespace,
            Subject::Container(r) => &r.namespace,
            Subject::Service(r) => &r.namespace,
            Subject::Deployment(r) => &r.namespace,
        }
    }

    /// Where dynamic attributes land.
    fn attr_root(&self) -> &'static [&'static str] {
        match self {
            Subject::Container(_) => &[],
            _ => &["spec"],
        }
    }

    /// Paths dynamic attributes may not replace.
    fn protected(&self) -> &'static [&'static str] {
        match self {
            Subject::Container(_) => &["image"],
            _ => &[],
        }
    }
}

/// How a fixed-slot profile is written into the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTarget {
    /// Each top-level key of the config is written under the path.
    Splice(&'static [&'static str]),
    /// The whole config replaces the value at the path.
    Assign(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct SlotBinding<'a> {
    /// Slot name used in error markers, e.g. `metadata`, `selector`.
    pub slot: &'static str,
    pub target: SlotTarget,
    pub resolution: Resolution<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct AttrBinding<'a> {
    pub key: &'a str,
    pub resolution: Resolution<'a>,
}

/// Sub-manifests composed ahead of their parent.
#[derive(Debug, Clone, Default)]
pub enum Embedded {
    #[default]
    Nothing,
    /// A pod's containers, in the order the pod lists them.
    Containers(Vec<ComposedManifest>),
    /// A deployment's pod; `None` when the pod reference is dangling.
    Pod(Option<ComposedManifest>),
}

impl Embedded {
    fn label(&self) -> &'static str {
        match self {
            Embedded::Nothing => "nothing",
            Embedded::Containers(_) => "containers",
            Embedded::Pod(_) => "pod",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeInput<'a> {
    pub subject: Subject<'a>,
    pub slots: SmallVec<[SlotBinding<'a>; 2]>,
    pub attrs: Vec<AttrBinding<'a>>,
    pub embedded: Embedded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("{kind} {name}: cannot embed {embedded}")]
    UnexpectedEmbedding { kind: ResourceKind, name: String, embedded: &'static str },
    #[error("{kind} {name}: cannot write {path}: parent is not a mapping")]
    PathConflict { kind: ResourceKind, name: String, path: String },
}

#[derive(Debug, Clone, Default)]
pub struct Composer {
    opts: ComposerOptions,
}

impl Composer {
    pub fn new(opts: ComposerOptions) -> Self { Self { opts } }
    pub fn options(&self) -> &ComposerOptions { &self.opts }

    pub fn merge(&self, input: MergeInput<'_>) -> Result<ComposedManifest, MergeError> {
        let subject = input.subject;
        let mut doc = Doc::new(subject);

        self.skeleton(&mut doc)?;
        self.scalars(&mut doc)?;
        for slot in input.slots.iter() {
            self.apply_slot(&mut doc, slot)?;
        }
        self.embed(&mut doc, input.embedded)?;
        for attr in input.attrs.iter() {
            self.apply_attr(&mut doc, attr)?;
        }
        Ok(ComposedManifest::new(Json::Object(doc.root)))
    }

    fn skeleton(&self, doc: &mut Doc<'_>) -> Result<(), MergeError> {
        let subject = doc.subject;
        let (api_version, kind) = match subject {
            Subject::Pod(_) => ("v1", "Pod"),
            Subject::Service(_) => ("v1", "Service"),
            Subject::Deployment(_) => ("apps/v1", "Deployment"),
            Subject::Container(_) => {
                doc.set_explicit(&["name"], Json::String(subject.name().to_string()))?;
                doc.set_explicit(&["image"], Json::String(self.opts.image_placeholder.clone()))?;
                return Ok(());
            }
        };
        doc.set(&["apiVersion"], Json::String(api_version.into()))?;
        doc.set(&["kind"], Json::String(kind.into()))?;
        doc.set_explicit(&["metadata", "name"], Json::String(subject.name().to_string()))?;
        if !subject.namespace().is_empty() {
            doc.set_explicit(&["metadata", "namespace"], Json::String(subject.namespace().to_string()))?;
        }
        match subject {
            Subject::Pod(_) => doc.set(&["spec", "containers"], Json::Array(Vec::new())),
            _ => doc.set(&["spec"], Json::Object(Map::new())),
        }
    }

    fn scalars(&self, doc: &mut Doc<'_>) -> Result<(), MergeError> {
        let subject = doc.subject;
        match subject {
            Subject::Container(c) => {
                doc.opt_str(&["imagePullPolicy"], c.image_pull_policy.as_deref())?;
                doc.opt_list(&["command"], c.command.as_deref())?;
                doc.opt_list(&["args"], c.args.as_deref())?;
                doc.opt_str(&["workingDir"], c.working_dir.as_deref())?;
                doc.opt_bool(&["tty"], c.tty)?;
                doc.opt_bool(&["stdin"], c.stdin)?;
            }
            Subject::Pod(p) => {
                doc.opt_str(&["spec", "serviceAccountName"], p.service_account_name.as_deref())?;
                doc.opt_bool(&["spec", "hostNetwork"], p.host_network)?;
                doc.opt_str(&["spec", "dnsPolicy"], p.dns_policy.as_deref())?;
                doc.opt_str(&["spec", "restartPolicy"], p.restart_policy.as_deref())?;
            }
            Subject::Service(s) => {
                doc.opt_str(&["spec", "type"], s.service_type.as_deref())?;
                doc.opt_str(&["spec", "clusterIP"], s.cluster_ip.as_deref())?;
                doc.opt_str(&["spec", "sessionAffinity"], s.session_affinity.as_deref())?;
            }
            Subject::Deployment(d) => {
                doc.opt_int(&["spec", "replicas"], d.replicas)?;
                doc.opt_int(&["spec", "minReadySeconds"], d.min_ready_seconds)?;
                doc.opt_int(&["spec", "revisionHistoryLimit"], d.revision_history_limit)?;
                doc.opt_str(&["spec", "strategy", "type"], d.strategy_type.as_deref())?;
            }
        }
        Ok(())
    }

    fn apply_slot(&self, doc: &mut Doc<'_>, binding: &SlotBinding<'_>) -> Result<(), MergeError> {
        let Some(rp) = binding.resolution.profile() else {
            return Ok(());
        };
        let value = self.config_or_marker(binding.slot, rp);
        match binding.target {
            SlotTarget::Assign(path) => {
                if doc.is_explicit(path) {
                    debug!(slot = binding.slot, path = %path.join("."), "slot profile shadowed by explicit field");
                    return Ok(());
                }
                doc.set(path, value)
            }
            SlotTarget::Splice(path) => {
                let map = match value {
                    Json::Object(map) => map,
                    _ => {
                        warn!(slot = binding.slot, id = rp.profile.id, "slot profile config is not a mapping");
                        marker_map(format!("Invalid {} config: expected a mapping", binding.slot), None)
                    }
                };
                for (k, v) in map {
                    let mut full: Vec<&str> = path.to_vec();
                    full.push(k.as_str());
                    if doc.is_explicit(&full) {
                        debug!(slot = binding.slot, key = %k, "slot key shadowed by explicit field");
                        continue;
                    }
                    doc.set(&full, v)?;
                }
                Ok(())
            }
        }
    }

    fn embed(&self, doc: &mut Doc<'_>, embedded: Embedded) -> Result<(), MergeError> {
        match (doc.subject, embedded) {
            (_, Embedded::Nothing) => Ok(()),
            (Subject::Pod(_), Embedded::Containers(list)) => {
                let items = list.into_iter().map(ComposedManifest::into_value).collect();
                doc.set(&["spec", "containers"], Json::Array(items))
            }
            (Subject::Deployment(_), Embedded::Pod(None)) => Ok(()),
            (Subject::Deployment(_), Embedded::Pod(Some(pod))) => doc.set(&["spec", "template"], pod_template(pod)),
            (subject, other) => Err(MergeError::UnexpectedEmbedding {
                kind: subject.kind(),
                name: subject.name().to_string(),
                embedded: other.label(),
            }),
        }
    }

    fn apply_attr(&self, doc: &mut Doc<'_>, binding: &AttrBinding<'_>) -> Result<(), MergeError> {
        let Some(rp) = binding.resolution.profile() else {
            return Ok(());
        };
        let root = doc.subject.attr_root();
        if root.is_empty() && doc.subject.protected().iter().any(|p| *p == binding.key) {
            warn!(key = binding.key, kind = %doc.subject.kind(), "dynamic attribute targets a reserved field; skipped");
            return Ok(());
        }
        let mut path: Vec<&str> = root.to_vec();
        path.push(binding.key);
        if doc.get(&path).is_some() {
            debug!(key = binding.key, "dynamic attribute replaces an existing value");
        }
        let value = self.config_or_marker(binding.key, rp);
        doc.set(&path, value)
    }

    fn config_or_marker(&self, key: &str, rp: &ResolvedProfile) -> Json {
        match &rp.parsed {
            Ok(v) => v.clone(),
            Err(e) => {
                let raw = if self.opts.include_raw { Some(e.raw.clone()) } else { None };
                Json::Object(marker_map(format!("Failed to parse {} config", key), raw))
            }
        }
    }
}

fn marker_map(error: String, raw: Option<String>) -> Map<String, Json> {
    let mut m = Map::new();
    m.insert("error".into(), Json::String(error));
    if let Some(raw) = raw {
        m.insert("raw".into(), Json::String(raw));
    }
    m
}

/// `{metadata, spec}` of a composed pod; the template inherits name and
/// namespace from its owner.
fn pod_template(pod: ComposedManifest) -> Json {
    let mut out = Map::new();
    if let Json::Object(mut root) = pod.into_value() {
        if let Some(Json::Object(meta)) = root.remove("metadata") {
            // remaining keys stay in insertion order
            let meta: Map<String, Json> = meta.into_iter().filter(|(k, _)| k != "name" && k != "namespace").collect();
            if !meta.is_empty() {
                out.insert("metadata".into(), Json::Object(meta));
            }
        }
        if let Some(spec) = root.remove("spec") {
            out.insert("spec".into(), spec);
        }
    }
    Json::Object(out)
}

/// Document under construction plus the paths written from explicit fields.
struct Doc<'a> {
    subject: Subject<'a>,
    root: Map<String, Json>,
    explicit: Vec<Vec<String>>,
}

impl<'a> Doc<'a> {
    fn new(subject: Subject<'a>) -> Self { Self { subject, root: Map::new(), explicit: Vec::new() } }

    fn get(&self, path: &[&str]) -> Option<&Json> {
        let (last, parents) = path.split_last()?;
        let mut cur = &self.root;
        for seg in parents {
            cur = cur.get(*seg)?.as_object()?;
        }
        cur.get(*last)
    }

    fn set(&mut self, path: &[&str], value: Json) -> Result<(), MergeError> {
        let Some((last, parents)) = path.split_last() else {
            return Ok(());
        };
        let mut cur = &mut self.root;
        for seg in parents {
            let next = cur.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
            cur = match next {
                Json::Object(map) => map,
                _ => {
                    return Err(MergeError::PathConflict {
                        kind: self.subject.kind(),
                        name: self.subject.name().to_string(),
                        path: path.join("."),
                    })
                }
            };
        }
        cur.insert(last.to_string(), value);
        Ok(())
    }

    fn set_explicit(&mut self, path: &[&str], value: Json) -> Result<(), MergeError> {
        self.set(path, value)?;
        self.explicit.push(path.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    /// True when `path` lies on, above or below an explicitly written path.
    fn is_explicit(&self, path: &[&str]) -> bool {
        self.explicit.iter().any(|e| {
            let n = e.len().min(path.len());
            e[..n].iter().zip(&path[..n]).all(|(a, b)| a == b)
        })
    }

    fn opt_str(&mut self, path: &[&str], v: Option<&str>) -> Result<(), MergeError> {
        match v {
            Some(s) if !s.is_empty() => self.set_explicit(path, Json::String(s.to_string())),
            _ => Ok(()),
        }
    }

    fn opt_list(&mut self, path: &[&str], v: Option<&[String]>) -> Result<(), MergeError> {
        match v {
            Some(items) if !items.is_empty() => {
                self.set_explicit(path, Json::Array(items.iter().cloned().map(Json::String).collect()))
            }
            _ => Ok(()),
        }
    }

    fn opt_bool(&mut self, path: &[&str], v: Option<bool>) -> Result<(), MergeError> {
        match v {
            Some(b) => self.set_explicit(path, Json::Bool(b)),
            None => Ok(()),
        }
    }

    fn opt_int(&mut self, path: &[&str], v: Option<i32>) -> Result<(), MergeError> {
        match v {
            Some(n) => self.set_explicit(path, Json::from(n)),
            None => Ok(()),
        }
    }
}
