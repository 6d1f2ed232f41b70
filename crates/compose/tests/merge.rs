#![forbid(unsafe_code)]

use quilt_compose::{
    AttrBinding, ComposedManifest, Composer, ComposerOptions, Embedded, MergeError, MergeInput, SlotBinding, SlotTarget,
    Subject, DEFAULT_IMAGE_PLACEHOLDER,
};
use quilt_core::{ConfigParser, Container, Deployment, Pod, Profile, ProfileType, Resolution, ResolvedProfile, Service};
use serde_json::json;
use smallvec::smallvec;

fn resolved(id: i64, t: ProfileType, config: serde_json::Value) -> ResolvedProfile {
    let p = Profile { id, name: String::new(), profile_type: t, namespace: "default".into(), config };
    ResolvedProfile::new(p, &ConfigParser::strict())
}

fn container(id: i64, name: &str) -> Container {
    Container { id, name: name.into(), namespace: "default".into(), ..Default::default() }
}

fn compose_container(c: &Container, attrs: Vec<AttrBinding<'_>>) -> ComposedManifest {
    Composer::default()
        .merge(MergeInput { subject: Subject::Container(c), slots: smallvec![], attrs, embedded: Embedded::Nothing })
        .unwrap()
}

#[test]
fn absent_scalars_are_omitted_not_nulled() {
    let pod = Pod { id: 1, name: "web".into(), namespace: "default".into(), ..Default::default() };
    let m = Composer::default()
        .merge(MergeInput { subject: Subject::Pod(&pod), slots: smallvec![], attrs: vec![], embedded: Embedded::Nothing })
        .unwrap();
    let spec = m.pointer("/spec").unwrap().as_object().unwrap();
    assert!(!spec.contains_key("dnsPolicy"));
    assert!(!spec.contains_key("hostNetwork"));
    assert_eq!(spec.get("containers"), Some(&json!([])));
    assert_eq!(m.pointer("/metadata"), Some(&json!({"name": "web", "namespace": "default"})));
}

#[test]
fn empty_strings_and_lists_count_as_absent() {
    let mut c = container(1, "app");
    c.image_pull_policy = Some(String::new());
    c.command = Some(vec![]);
    c.tty = Some(false);
    let m = compose_container(&c, vec![]);
    assert_eq!(m.as_value(), &json!({"name": "app", "image": DEFAULT_IMAGE_PLACEHOLDER, "tty": false}));
}

#[test]
fn container_scalars_map_to_camel_case_paths() {
    let mut c = container(101, "app");
    c.image_pull_policy = Some("Always".into());
    c.command = Some(vec!["./run".into()]);
    c.args = Some(vec!["--port".into(), "8080".into()]);
    c.working_dir = Some("/srv".into());
    c.stdin = Some(true);
    let m = compose_container(&c, vec![]);
    assert_eq!(
        m.as_value(),
        &json!({
            "name": "app",
            "image": DEFAULT_IMAGE_PLACEHOLDER,
            "imagePullPolicy": "Always",
            "command": ["./run"],
            "args": ["--port", "8080"],
            "workingDir": "/srv",
            "stdin": true
        })
    );
}

#[test]
fn dynamic_attribute_lands_verbatim() {
    let c = container(1, "app");
    let p = resolved(7, ProfileType::ContainerProfile, json!({"limits": {"cpu": "500m"}}));
    let m = compose_container(&c, vec![AttrBinding { key: "resources", resolution: Resolution::Resolved(&p) }]);
    assert_eq!(m.pointer("/resources"), Some(&json!({"limits": {"cpu": "500m"}})));
}

#[test]
fn malformed_attribute_renders_marker_next_to_valid_one() {
    let c = container(1, "app");
    let bad = resolved(8, ProfileType::ContainerProfile, json!("{\"limits\": "));
    let good = resolved(9, ProfileType::ContainerProfile, json!({"containerPort": 80}));
    let m = compose_container(
        &c,
        vec![
            AttrBinding { key: "resources", resolution: Resolution::Resolved(&bad) },
            AttrBinding { key: "ports", resolution: Resolution::Resolved(&good) },
        ],
    );
    assert_eq!(m.pointer("/resources/error"), Some(&json!("Failed to parse resources config")));
    assert_eq!(m.pointer("/resources/raw"), Some(&json!("{\"limits\": ")));
    assert_eq!(m.pointer("/ports"), Some(&json!({"containerPort": 80})));
    assert_eq!(m.error_markers(), vec!["resources".to_string()]);
}

#[test]
fn marker_without_raw_when_disabled() {
    let c = container(1, "app");
    let bad = resolved(8, ProfileType::ContainerProfile, json!("nope"));
    let composer = Composer::new(ComposerOptions { include_raw: false, ..Default::default() });
    let m = composer
        .merge(MergeInput {
            subject: Subject::Container(&c),
            slots: smallvec![],
            attrs: vec![AttrBinding { key: "env", resolution: Resolution::Resolved(&bad) }],
            embedded: Embedded::Nothing,
        })
        .unwrap();
    assert_eq!(m.pointer("/env"), Some(&json!({"error": "Failed to parse env config"})));
}

#[test]
fn unresolved_attribute_is_omitted() {
    let c = container(1, "app");
    let m = compose_container(&c, vec![AttrBinding { key: "resources", resolution: Resolution::Unresolved }]);
    assert!(m.pointer("/resources").is_none());
    assert!(m.error_markers().is_empty());
}

#[test]
fn container_image_cannot_be_replaced_by_an_attribute() {
    let c = container(1, "app");
    let p = resolved(3, ProfileType::ContainerProfile, json!("nginx:latest"));
    let p = ResolvedProfile { parsed: Ok(json!("nginx:latest")), ..p };
    let m = compose_container(&c, vec![AttrBinding { key: "image", resolution: Resolution::Resolved(&p) }]);
    assert_eq!(m.pointer("/image"), Some(&json!(DEFAULT_IMAGE_PLACEHOLDER)));
}

#[test]
fn metadata_profile_is_base_and_explicit_name_wins() {
    let pod = Pod { id: 1, name: "web".into(), namespace: "default".into(), ..Default::default() };
    let meta = resolved(
        5,
        ProfileType::PodMetadataProfile,
        json!({"name": "hijack", "labels": {"tier": "web"}, "annotations": {"team": "core"}}),
    );
    let m = Composer::default()
        .merge(MergeInput {
            subject: Subject::Pod(&pod),
            slots: smallvec![SlotBinding {
                slot: "metadata",
                target: SlotTarget::Splice(&["metadata"]),
                resolution: Resolution::Resolved(&meta),
            }],
            attrs: vec![],
            embedded: Embedded::Nothing,
        })
        .unwrap();
    assert_eq!(
        m.pointer("/metadata"),
        Some(&json!({"name": "web", "namespace": "default", "labels": {"tier": "web"}, "annotations": {"team": "core"}}))
    );
}

#[test]
fn non_mapping_metadata_profile_is_flagged() {
    let svc = Service { id: 1, name: "web".into(), ..Default::default() };
    let meta = resolved(5, ProfileType::ServiceMetadataProfile, json!(["not", "a", "map"]));
    let m = Composer::default()
        .merge(MergeInput {
            subject: Subject::Service(&svc),
            slots: smallvec![SlotBinding {
                slot: "metadata",
                target: SlotTarget::Splice(&["metadata"]),
                resolution: Resolution::Resolved(&meta),
            }],
            attrs: vec![],
            embedded: Embedded::Nothing,
        })
        .unwrap();
    assert_eq!(m.pointer("/metadata/error"), Some(&json!("Invalid metadata config: expected a mapping")));
    assert_eq!(m.pointer("/metadata/name"), Some(&json!("web")));
    assert_eq!(m.error_markers(), vec!["metadata".to_string()]);
}

#[test]
fn containers_keep_caller_order() {
    let pod = Pod { id: 1, name: "web".into(), containers: vec![2, 1], ..Default::default() };
    let c2 = compose_container(&container(2, "second"), vec![]);
    let c1 = compose_container(&container(1, "first"), vec![]);
    let m = Composer::default()
        .merge(MergeInput {
            subject: Subject::Pod(&pod),
            slots: smallvec![],
            attrs: vec![],
            embedded: Embedded::Containers(vec![c2, c1]),
        })
        .unwrap();
    let names: Vec<_> = m.pointer("/spec/containers").unwrap().as_array().unwrap().iter().map(|c| c["name"].clone()).collect();
    assert_eq!(names, vec![json!("second"), json!("first")]);
}

#[test]
fn deployment_selector_dangling_is_omitted() {
    let d = Deployment { id: 1, name: "web".into(), replicas: Some(3), selector_id: Some(42), ..Default::default() };
    let m = Composer::default()
        .merge(MergeInput {
            subject: Subject::Deployment(&d),
            slots: smallvec![SlotBinding {
                slot: "selector",
                target: SlotTarget::Assign(&["spec", "selector"]),
                resolution: Resolution::Unresolved,
            }],
            attrs: vec![],
            embedded: Embedded::Pod(None),
        })
        .unwrap();
    assert_eq!(m.pointer("/spec"), Some(&json!({"replicas": 3})));
}

#[test]
fn deployment_embeds_pod_as_template() {
    let pod = Pod { id: 1, name: "web".into(), namespace: "default".into(), dns_policy: Some("ClusterFirst".into()), ..Default::default() };
    let pod_m = Composer::default()
        .merge(MergeInput { subject: Subject::Pod(&pod), slots: smallvec![], attrs: vec![], embedded: Embedded::Nothing })
        .unwrap();
    let d = Deployment { id: 2, name: "web".into(), strategy_type: Some("Recreate".into()), ..Default::default() };
    let sel = resolved(11, ProfileType::DeploymentSelectorProfile, json!({"matchLabels": {"app": "web"}}));
    let m = Composer::default()
        .merge(MergeInput {
            subject: Subject::Deployment(&d),
            slots: smallvec![SlotBinding {
                slot: "selector",
                target: SlotTarget::Assign(&["spec", "selector"]),
                resolution: Resolution::Resolved(&sel),
            }],
            attrs: vec![],
            embedded: Embedded::Pod(Some(pod_m)),
        })
        .unwrap();
    assert_eq!(m.pointer("/apiVersion"), Some(&json!("apps/v1")));
    assert_eq!(m.pointer("/spec/strategy/type"), Some(&json!("Recreate")));
    assert_eq!(m.pointer("/spec/selector/matchLabels/app"), Some(&json!("web")));
    assert_eq!(m.pointer("/spec/template"), Some(&json!({"spec": {"containers": [], "dnsPolicy": "ClusterFirst"}})));
    let keys: Vec<_> = m.pointer("/spec").unwrap().as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["strategy", "selector", "template"]);
}

#[test]
fn template_metadata_keeps_profile_key_order() {
    let pod = Pod { id: 1, name: "web".into(), namespace: "default".into(), ..Default::default() };
    let bad = resolved(5, ProfileType::PodMetadataProfile, json!("{bad"));
    let pod_m = Composer::default()
        .merge(MergeInput {
            subject: Subject::Pod(&pod),
            slots: smallvec![SlotBinding {
                slot: "metadata",
                target: SlotTarget::Splice(&["metadata"]),
                resolution: Resolution::Resolved(&bad),
            }],
            attrs: vec![],
            embedded: Embedded::Nothing,
        })
        .unwrap();
    let d = Deployment { id: 2, name: "web".into(), namespace: "default".into(), ..Default::default() };
    let m = Composer::default()
        .merge(MergeInput { subject: Subject::Deployment(&d), slots: smallvec![], attrs: vec![], embedded: Embedded::Pod(Some(pod_m)) })
        .unwrap();
    let keys: Vec<_> = m.pointer("/spec/template/metadata").unwrap().as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["error", "raw"]);
    let yaml = m.to_yaml().unwrap();
    let (e, r) = (yaml.find("error: Failed to parse metadata config").unwrap(), yaml.find("raw:").unwrap());
    assert!(e < r, "{}", yaml);
}

#[test]
fn embedding_the_wrong_shape_is_rejected() {
    let svc = Service { id: 1, name: "web".into(), ..Default::default() };
    let err = Composer::default()
        .merge(MergeInput {
            subject: Subject::Service(&svc),
            slots: smallvec![],
            attrs: vec![],
            embedded: Embedded::Containers(vec![]),
        })
        .unwrap_err();
    assert!(matches!(err, MergeError::UnexpectedEmbedding { embedded: "containers", .. }));
}

#[test]
fn merge_is_deterministic() {
    let svc = Service {
        id: 1,
        name: "web".into(),
        namespace: "default".into(),
        service_type: Some("ClusterIP".into()),
        ..Default::default()
    };
    let sel = resolved(2, ProfileType::ServiceSelectorProfile, json!("{\"app\":\"web\",\"tier\":\"front\"}"));
    let ports = resolved(3, ProfileType::ServiceProfile, json!([{"port": 80, "targetPort": 8080}]));
    let render = || {
        Composer::default()
            .merge(MergeInput {
                subject: Subject::Service(&svc),
                slots: smallvec![SlotBinding {
                    slot: "selector",
                    target: SlotTarget::Assign(&["spec", "selector"]),
                    resolution: Resolution::Resolved(&sel),
                }],
                attrs: vec![AttrBinding { key: "ports", resolution: Resolution::Resolved(&ports) }],
                embedded: Embedded::Nothing,
            })
            .unwrap()
            .to_yaml()
            .unwrap()
    };
    let first = render();
    for _ in 0..5 {
        assert_eq!(render(), first);
    }
    assert!(first.find("app: web").unwrap() < first.find("tier: front").unwrap());
}
