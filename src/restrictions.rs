// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;

pub const ANNOTATION_PREFIX: &str = "authn-k8s";
pub const DEFAULT_CONTAINER_NAME: &str = "authenticator";
const CONTAINER_NAME_KEY: &str = "authentication-container-name";
const LEGACY_CONTAINER_NAME_ANNOTATION: &str = "kubernetes/authentication-container-name";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(
        "CONJ00048E Invalid Kubernetes host id: {0}. Must end with <namespace>/<resource_type>/<resource_id>"
    )]
    InvalidHostId(String),
    #[error(
        "CONJ00050E Resource type '{0}' is not a supported resource restriction. The supported resources are '{1}'"
    )]
    ConstraintNotSupported(String, String),
    #[error("CONJ00057E Role does not have the required constraint: {0}")]
    RoleMissingConstraint(String),
    #[error(
        "CONJ00055E Resource restrictions include an illegal combination of resource constraints - '{0}'"
    )]
    IllegalConstraintCombinations(String),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidHostId(_) => "CONJ00048E",
            Error::ConstraintNotSupported(..) => "CONJ00050E",
            Error::RoleMissingConstraint(_) => "CONJ00057E",
            Error::IllegalConstraintCombinations(_) => "CONJ00055E",
        }
    }
}

/// The kinds of constraint a host can place on the pod authenticating as it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Namespace,
    NamespaceLabelSelector,
    ServiceAccount,
    Pod,
    Deployment,
    StatefulSet,
    DeploymentConfig,
}

impl ResourceType {
    /// All types, in the order restrictions are listed and validated.
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Namespace,
        ResourceType::NamespaceLabelSelector,
        ResourceType::ServiceAccount,
        ResourceType::Pod,
        ResourceType::Deployment,
        ResourceType::StatefulSet,
        ResourceType::DeploymentConfig,
    ];

    const CONTROLLERS: [ResourceType; 3] = [
        ResourceType::Deployment,
        ResourceType::DeploymentConfig,
        ResourceType::StatefulSet,
    ];

    /// Name used in annotations, e.g. `authn-k8s/service-account`.
    pub fn annotation_key(&self) -> &'static str {
        match self {
            ResourceType::Namespace => "namespace",
            ResourceType::NamespaceLabelSelector => "namespace-label-selector",
            ResourceType::ServiceAccount => "service-account",
            ResourceType::Pod => "pod",
            ResourceType::Deployment => "deployment",
            ResourceType::StatefulSet => "stateful-set",
            ResourceType::DeploymentConfig => "deployment-config",
        }
    }

    /// Name used in host ids, e.g. `ns/service_account/name`.
    pub fn host_id_key(&self) -> &'static str {
        match self {
            ResourceType::Namespace => "namespace",
            ResourceType::NamespaceLabelSelector => "namespace_label_selector",
            ResourceType::ServiceAccount => "service_account",
            ResourceType::Pod => "pod",
            ResourceType::Deployment => "deployment",
            ResourceType::StatefulSet => "stateful_set",
            ResourceType::DeploymentConfig => "deployment_config",
        }
    }

    pub fn from_annotation_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.annotation_key() == key)
    }

    /// Label selectors cannot be expressed in a host id.
    fn from_host_id_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .filter(|t| *t != ResourceType::NamespaceLabelSelector)
            .find(|t| t.host_id_key() == key)
    }

    /// True for the types that pin the namespace of the pod.
    pub fn is_namespace(&self) -> bool {
        matches!(
            self,
            ResourceType::Namespace | ResourceType::NamespaceLabelSelector
        )
    }

    fn is_controller(&self) -> bool {
        Self::CONTROLLERS.contains(self)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.host_id_key())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct K8sResource {
    pub resource_type: ResourceType,
    pub value: String,
}

impl K8sResource {
    pub fn new(resource_type: ResourceType, value: impl Into<String>) -> Self {
        K8sResource {
            resource_type,
            value: value.into(),
        }
    }
}

// Lower sorts first: the most specific scope wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Scope {
    ServiceId,
    Global,
    Legacy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Key {
    Resource(ResourceType),
    ContainerName,
}

/// Annotation values keyed by what they mean, each holding every scope it was found at.
/// Keys under the authenticator prefix that mean nothing are kept aside; they only matter
/// when the restrictions come from annotations.
#[derive(Default, Debug)]
struct Candidates {
    values: BTreeMap<Key, Vec<(Scope, String)>>,
    unsupported: Vec<String>,
}

impl Candidates {
    fn collect(annotations: &BTreeMap<String, String>, service_id: &str) -> Self {
        let mut candidates = Candidates::default();
        let scoped_prefix = format!("{ANNOTATION_PREFIX}/{service_id}/");
        let global_prefix = format!("{ANNOTATION_PREFIX}/");
        for (name, value) in annotations {
            if name == LEGACY_CONTAINER_NAME_ANNOTATION {
                candidates.insert(Key::ContainerName, Scope::Legacy, value);
                continue;
            }
            let (scope, key) = if let Some(key) = name.strip_prefix(&scoped_prefix) {
                (Scope::ServiceId, key)
            } else if let Some(key) = name.strip_prefix(&global_prefix) {
                (Scope::Global, key)
            } else {
                continue;
            };
            // Other service ids, or nothing at all after the prefix.
            if key.is_empty() || key.contains('/') {
                continue;
            }
            match parse_annotation_key(key) {
                Some(key) => candidates.insert(key, scope, value),
                None => candidates.unsupported.push(key.to_string()),
            }
        }
        candidates
    }

    fn insert(&mut self, key: Key, scope: Scope, value: &str) {
        self.values
            .entry(key)
            .or_default()
            .push((scope, value.to_string()));
    }

    fn get(&self, key: Key) -> Option<&str> {
        self.values
            .get(&key)?
            .iter()
            .min_by_key(|(scope, _)| *scope)
            .map(|(_, value)| value.as_str())
    }

    fn has_resources(&self) -> bool {
        self.values.keys().any(|k| matches!(k, Key::Resource(_)))
    }

    fn check_supported(&self) -> Result<(), Error> {
        match self.unsupported.first() {
            None => Ok(()),
            Some(key) => {
                let supported = ResourceType::ALL
                    .iter()
                    .map(|t| t.annotation_key())
                    .chain(std::iter::once(CONTAINER_NAME_KEY))
                    .join(",");
                Err(Error::ConstraintNotSupported(key.clone(), supported))
            }
        }
    }
}

fn parse_annotation_key(key: &str) -> Option<Key> {
    if key == CONTAINER_NAME_KEY {
        return Some(Key::ContainerName);
    }
    ResourceType::from_annotation_key(key).map(Key::Resource)
}

/// Returns the part of a host name that encodes restrictions: its last three segments.
pub fn restriction_host_id(host_name: &str) -> String {
    let segments: Vec<&str> = host_name.split('/').collect();
    segments[segments.len().saturating_sub(3)..].join("/")
}

/// The constraints a pod must satisfy to authenticate as a given host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRestrictions {
    resources: Vec<K8sResource>,
    container_name: String,
}

impl ResourceRestrictions {
    /// Derives restrictions from the host's annotations if any restriction annotation is
    /// present, and from `host_id` (`namespace/type/value` or `namespace/*/*`) otherwise.
    /// Unknown `authn-k8s/` keys are rejected only in the first case.
    pub fn parse(
        host_id: &str,
        annotations: &BTreeMap<String, String>,
        service_id: &str,
    ) -> Result<Self, Error> {
        let candidates = Candidates::collect(annotations, service_id);
        let resources = if candidates.has_resources() {
            candidates.check_supported()?;
            ResourceType::ALL
                .into_iter()
                .filter_map(|t| {
                    candidates
                        .get(Key::Resource(t))
                        .map(|v| K8sResource::new(t, v))
                })
                .collect()
        } else {
            Self::from_host_id(host_id)?
        };
        validate(&resources)?;

        let container_name = candidates
            .get(Key::ContainerName)
            .unwrap_or(DEFAULT_CONTAINER_NAME)
            .to_string();
        Ok(ResourceRestrictions {
            resources,
            container_name,
        })
    }

    fn from_host_id(host_id: &str) -> Result<Vec<K8sResource>, Error> {
        let segments: Vec<&str> = host_id.split('/').collect();
        let [namespace, kind, value] = segments.as_slice() else {
            return Err(Error::InvalidHostId(host_id.to_string()));
        };
        if namespace.is_empty() {
            return Err(Error::InvalidHostId(host_id.to_string()));
        }
        let mut resources = vec![K8sResource::new(ResourceType::Namespace, *namespace)];
        if (*kind, *value) == ("*", "*") {
            return Ok(resources);
        }
        let resource_type = ResourceType::from_host_id_key(kind).ok_or_else(|| {
            let supported = ResourceType::ALL
                .iter()
                .filter(|t| **t != ResourceType::NamespaceLabelSelector)
                .map(|t| t.host_id_key())
                .join(",");
            Error::ConstraintNotSupported(kind.to_string(), supported)
        })?;
        if value.is_empty() {
            return Err(Error::InvalidHostId(host_id.to_string()));
        }
        // `ns/namespace/<anything>` pins the namespace only.
        if resource_type == ResourceType::Namespace {
            return Ok(resources);
        }
        resources.push(K8sResource::new(resource_type, *value));
        Ok(resources)
    }

    pub fn resources(&self) -> &[K8sResource] {
        &self.resources
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.value_of(ResourceType::Namespace)
    }

    pub fn namespace_label_selector(&self) -> Option<&str> {
        self.value_of(ResourceType::NamespaceLabelSelector)
    }

    /// True when the only restriction is on the namespace.
    pub fn is_namespace_scoped(&self) -> bool {
        self.resources.iter().all(|r| r.resource_type.is_namespace())
    }

    fn value_of(&self, resource_type: ResourceType) -> Option<&str> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type)
            .map(|r| r.value.as_str())
    }
}

fn validate(resources: &[K8sResource]) -> Result<(), Error> {
    let namespaces: Vec<_> = resources
        .iter()
        .filter(|r| r.resource_type.is_namespace())
        .collect();
    match namespaces.len() {
        0 => {
            return Err(Error::RoleMissingConstraint(
                ResourceType::Namespace.annotation_key().to_string(),
            ));
        }
        1 => {}
        _ => {
            return Err(Error::IllegalConstraintCombinations(
                namespaces
                    .iter()
                    .map(|r| r.resource_type.annotation_key())
                    .join(","),
            ));
        }
    }

    let controllers: Vec<_> = resources
        .iter()
        .filter(|r| r.resource_type.is_controller())
        .collect();
    if controllers.len() > 1 {
        return Err(Error::IllegalConstraintCombinations(
            controllers
                .iter()
                .map(|r| r.resource_type.annotation_key())
                .join(","),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use test_case::test_case;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parse(host_id: &str, pairs: &[(&str, &str)]) -> Result<ResourceRestrictions, Error> {
        ResourceRestrictions::parse(host_id, &annotations(pairs), "svc")
    }

    #[test]
    fn annotations_namespace_and_pod() {
        let r = parse(
            "ignored",
            &[("authn-k8s/namespace", "ns1"), ("authn-k8s/pod", "p1")],
        )
        .unwrap();
        assert_eq!(
            r.resources(),
            &[
                K8sResource::new(ResourceType::Namespace, "ns1"),
                K8sResource::new(ResourceType::Pod, "p1"),
            ]
        );
        assert_eq!(r.container_name(), "authenticator");
        assert!(!r.is_namespace_scoped());
    }

    #[test]
    fn service_id_scope_wins() {
        let r = parse(
            "ignored",
            &[
                ("authn-k8s/namespace", "global-ns"),
                ("authn-k8s/svc/namespace", "scoped-ns"),
                ("authn-k8s/service-account", "global-sa"),
                ("authn-k8s/authentication-container-name", "global-c"),
                ("authn-k8s/svc/authentication-container-name", "scoped-c"),
            ],
        )
        .unwrap();
        assert_eq!(r.namespace(), Some("scoped-ns"));
        assert_eq!(r.resources()[1].value, "global-sa");
        assert_eq!(r.container_name(), "scoped-c");
    }

    #[test]
    fn container_name_tiers() {
        let legacy = parse(
            "ns/*/*",
            &[("kubernetes/authentication-container-name", "legacy")],
        )
        .unwrap();
        assert_eq!(legacy.container_name(), "legacy");

        let global = parse(
            "ns/*/*",
            &[
                ("kubernetes/authentication-container-name", "legacy"),
                ("authn-k8s/authentication-container-name", "global"),
            ],
        )
        .unwrap();
        assert_eq!(global.container_name(), "global");
    }

    #[test]
    fn other_service_ids_ignored() {
        let r = parse(
            "ns/*/*",
            &[
                ("authn-k8s/other/namespace", "elsewhere"),
                ("authn-k8s/other/bogus", "x"),
                ("authn-k8sSomething/namespace", "nope"),
            ],
        )
        .unwrap();
        assert_eq!(r.namespace(), Some("ns"));
        assert!(r.is_namespace_scoped());
    }

    #[test]
    fn unsupported_annotation() {
        let err = parse(
            "ignored",
            &[("authn-k8s/namespace", "ns"), ("authn-k8s/replica-set", "rs")],
        )
        .unwrap_err();
        assert_matches!(err, Error::ConstraintNotSupported(ref k, _) if k == "replica-set");
        assert_eq!(err.code(), "CONJ00050E");
    }

    #[test]
    fn annotations_require_namespace() {
        let err = parse("ns/*/*", &[("authn-k8s/pod", "p1")]).unwrap_err();
        assert_eq!(err, Error::RoleMissingConstraint("namespace".to_string()));
    }

    #[test]
    fn namespace_label_selector() {
        let r = parse(
            "ignored",
            &[("authn-k8s/namespace-label-selector", "team=a")],
        )
        .unwrap();
        assert_eq!(r.namespace(), None);
        assert_eq!(r.namespace_label_selector(), Some("team=a"));
        assert!(r.is_namespace_scoped());

        let err = parse(
            "ignored",
            &[
                ("authn-k8s/namespace", "ns"),
                ("authn-k8s/namespace-label-selector", "team=a"),
            ],
        )
        .unwrap_err();
        assert_matches!(err, Error::IllegalConstraintCombinations(_));
    }

    #[test_case("deployment", "stateful-set")]
    #[test_case("deployment", "deployment-config")]
    #[test_case("stateful-set", "deployment-config")]
    fn illegal_controller_pairs(a: &str, b: &str) {
        let a = format!("authn-k8s/{a}");
        let b = format!("authn-k8s/{b}");
        let err = parse(
            "ignored",
            &[("authn-k8s/namespace", "ns"), (a.as_str(), "x"), (b.as_str(), "y")],
        )
        .unwrap_err();
        assert_matches!(err, Error::IllegalConstraintCombinations(_));
    }

    #[test]
    fn illegal_controller_triple() {
        let err = parse(
            "ignored",
            &[
                ("authn-k8s/namespace", "ns"),
                ("authn-k8s/deployment", "d"),
                ("authn-k8s/svc/stateful-set", "s"),
                ("authn-k8s/deployment-config", "dc"),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::IllegalConstraintCombinations(
                "deployment,stateful-set,deployment-config".to_string()
            )
        );
    }

    #[test_case("ns/service_account/sa", ResourceType::ServiceAccount, "sa")]
    #[test_case("ns/pod/p", ResourceType::Pod, "p")]
    #[test_case("ns/deployment/d", ResourceType::Deployment, "d")]
    #[test_case("ns/stateful_set/s", ResourceType::StatefulSet, "s")]
    #[test_case("ns/deployment_config/dc", ResourceType::DeploymentConfig, "dc")]
    fn host_id(host_id: &str, resource_type: ResourceType, value: &str) {
        let r = parse(host_id, &[]).unwrap();
        assert_eq!(
            r.resources(),
            &[
                K8sResource::new(ResourceType::Namespace, "ns"),
                K8sResource::new(resource_type, value),
            ]
        );
    }

    #[test]
    fn host_id_namespace_only() {
        let r = parse("ns/*/*", &[]).unwrap();
        assert_eq!(r.resources(), &[K8sResource::new(ResourceType::Namespace, "ns")]);
        assert!(r.is_namespace_scoped());
    }

    #[test_case(""; "empty")]
    #[test_case("ns"; "one segment")]
    #[test_case("ns/pod"; "two segments")]
    #[test_case("a/ns/pod/p"; "four segments")]
    #[test_case("/pod/p"; "empty namespace")]
    #[test_case("ns/pod/"; "empty value")]
    fn invalid_host_id(host_id: &str) {
        assert_eq!(
            parse(host_id, &[]),
            Err(Error::InvalidHostId(host_id.to_string()))
        );
    }

    #[test_case("ns/service-account/sa"; "hyphenated")]
    #[test_case("ns/replica_set/rs"; "unknown")]
    #[test_case("ns/namespace_label_selector/team=a"; "label selector")]
    fn unsupported_host_id_type(host_id: &str) {
        assert_matches!(parse(host_id, &[]), Err(Error::ConstraintNotSupported(..)));
    }

    #[test]
    fn host_id_namespace_type() {
        let r = parse("ns/namespace/ns", &[]).unwrap();
        assert_eq!(r.resources(), &[K8sResource::new(ResourceType::Namespace, "ns")]);
        assert!(r.is_namespace_scoped());
    }

    #[test]
    fn unknown_annotation_ignored_for_host_id() {
        let r = parse(
            "ns/*/*",
            &[
                ("authn-k8s/foo", "x"),
                ("authn-k8s/svc/bar", "y"),
                ("authn-k8s/authentication-container-name", "sidecar"),
            ],
        )
        .unwrap();
        assert_eq!(r.namespace(), Some("ns"));
        assert!(r.is_namespace_scoped());
        assert_eq!(r.container_name(), "sidecar");
    }

    #[test]
    fn restriction_host_id_suffix() {
        assert_eq!(
            restriction_host_id("conjur/authn-k8s/svc/apps/ns/pod/p"),
            "ns/pod/p"
        );
        assert_eq!(restriction_host_id("ns/pod"), "ns/pod");
    }
}
