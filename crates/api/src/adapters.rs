//! Per-kind adapters: the fixed slots each kind carries, where they land, and
//! which kinds it embeds. A new resource kind is one more adapter here.

use quilt_compose::{AttrBinding, ComposedManifest, Composer, Embedded, MergeError, MergeInput, SlotBinding, SlotTarget, Subject};
use quilt_core::{Container, Deployment, DynamicAttrs, Pod, ProfileType, ResourceKind, Service};
use quilt_resolve::{ProfileRequest, ResolvedProfiles};
use smallvec::{smallvec, SmallVec};

const METADATA: SlotTarget = SlotTarget::Splice(&["metadata"]);
const SELECTOR: SlotTarget = SlotTarget::Assign(&["spec", "selector"]);

/// A resource with its embedded sub-resources already loaded.
pub(crate) trait Adapter: Sync {
    fn kind(&self) -> ResourceKind;
    fn namespace(&self) -> &str;
    /// Add every profile this resource and its embedded resources reference.
    fn collect(&self, req: &mut ProfileRequest);
    /// Compose embedded resources first, then this one.
    fn compose(&self, composer: &Composer, resolved: &ResolvedProfiles) -> Result<ComposedManifest, MergeError>;
}

pub(crate) struct PodTree {
    pub pod: Pod,
    /// Loaded containers in the order the pod lists them; dangling ids dropped.
    pub containers: Vec<Container>,
}

pub(crate) struct DeploymentTree {
    pub deployment: Deployment,
    pub pod: Option<PodTree>,
}

fn attr_bindings<'a>(attrs: &'a DynamicAttrs, t: ProfileType, resolved: &'a ResolvedProfiles) -> Vec<AttrBinding<'a>> {
    attrs.iter().map(|(key, id)| AttrBinding { key, resolution: resolved.lookup(t, id) }).collect()
}

impl Adapter for Container {
    fn kind(&self) -> ResourceKind { ResourceKind::Container }
    fn namespace(&self) -> &str { &self.namespace }

    fn collect(&self, req: &mut ProfileRequest) {
        req.add_attrs(ProfileType::ContainerProfile, &self.dynamic_attr);
    }

    fn compose(&self, composer: &Composer, resolved: &ResolvedProfiles) -> Result<ComposedManifest, MergeError> {
        composer.merge(MergeInput {
            subject: Subject::Container(self),
            slots: SmallVec::new(),
            attrs: attr_bindings(&self.dynamic_attr, ProfileType::ContainerProfile, resolved),
            embedded: Embedded::Nothing,
        })
    }
}

impl Adapter for PodTree {
    fn kind(&self) -> ResourceKind { ResourceKind::Pod }
    fn namespace(&self) -> &str { &self.pod.namespace }

    fn collect(&self, req: &mut ProfileRequest) {
        req.add_opt(ProfileType::PodMetadataProfile, self.pod.metadata_profile_id);
        req.add_attrs(ProfileType::PodProfile, &self.pod.dynamic_attr);
        for c in &self.containers {
            c.collect(req);
        }
    }

    fn compose(&self, composer: &Composer, resolved: &ResolvedProfiles) -> Result<ComposedManifest, MergeError> {
        let containers = self
            .containers
            .iter()
            .map(|c| c.compose(composer, resolved))
            .collect::<Result<Vec<_>, _>>()?;
        composer.merge(MergeInput {
            subject: Subject::Pod(&self.pod),
            slots: smallvec![SlotBinding {
                slot: "metadata",
                target: METADATA,
                resolution: resolved.lookup_opt(ProfileType::PodMetadataProfile, self.pod.metadata_profile_id),
            }],
            attrs: attr_bindings(&self.pod.dynamic_attr, ProfileType::PodProfile, resolved),
            embedded: Embedded::Containers(containers),
        })
    }
}

impl Adapter for Service {
    fn kind(&self) -> ResourceKind { ResourceKind::Service }
    fn namespace(&self) -> &str { &self.namespace }

    fn collect(&self, req: &mut ProfileRequest) {
        req.add_opt(ProfileType::ServiceMetadataProfile, self.metadata_profile_id);
        req.add_opt(ProfileType::ServiceSelectorProfile, self.selector_id);
        req.add_attrs(ProfileType::ServiceProfile, &self.dynamic_attr);
    }

    fn compose(&self, composer: &Composer, resolved: &ResolvedProfiles) -> Result<ComposedManifest, MergeError> {
        composer.merge(MergeInput {
            subject: Subject::Service(self),
            slots: smallvec![
                SlotBinding {
                    slot: "metadata",
                    target: METADATA,
                    resolution: resolved.lookup_opt(ProfileType::ServiceMetadataProfile, self.metadata_profile_id),
                },
                SlotBinding {
                    slot: "selector",
                    target: SELECTOR,
                    resolution: resolved.lookup_opt(ProfileType::ServiceSelectorProfile, self.selector_id),
                },
            ],
            attrs: attr_bindings(&self.dynamic_attr, ProfileType::ServiceProfile, resolved),
            embedded: Embedded::Nothing,
        })
    }
}

impl Adapter for DeploymentTree {
    fn kind(&self) -> ResourceKind { ResourceKind::Deployment }
    fn namespace(&self) -> &str { &self.deployment.namespace }

    fn collect(&self, req: &mut ProfileRequest) {
        let d = &self.deployment;
        req.add_opt(ProfileType::DeploymentMetadataProfile, d.metadata_profile_id);
        req.add_opt(ProfileType::DeploymentSelectorProfile, d.selector_id);
        req.add_attrs(ProfileType::DeploymentProfile, &d.dynamic_attr);
        if let Some(pod) = &self.pod {
            pod.collect(req);
        }
    }

    fn compose(&self, composer: &Composer, resolved: &ResolvedProfiles) -> Result<ComposedManifest, MergeError> {
        let d = &self.deployment;
        let pod = self.pod.as_ref().map(|p| p.compose(composer, resolved)).transpose()?;
        composer.merge(MergeInput {
            subject: Subject::Deployment(d),
            slots: smallvec![
                SlotBinding {
                    slot: "metadata",
                    target: METADATA,
                    resolution: resolved.lookup_opt(ProfileType::DeploymentMetadataProfile, d.metadata_profile_id),
                },
                SlotBinding {
                    slot: "selector",
                    target: SELECTOR,
                    resolution: resolved.lookup_opt(ProfileType::DeploymentSelectorProfile, d.selector_id),
                },
            ],
            attrs: attr_bindings(&d.dynamic_attr, ProfileType::DeploymentProfile, resolved),
            embedded: Embedded::Pod(pod),
        })
    }
}
