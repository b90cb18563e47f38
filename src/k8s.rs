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

//! Read-only access to the Kubernetes objects that back pod authentication.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use url::Url;

use crate::restrictions::ResourceType;
use crate::socket::ConnectOptions;

pub mod client;
pub mod config;
pub mod resolver;
pub mod validator;

pub use client::KubeClient;
pub use validator::K8sResourceValidator;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CONJ00024E No pod found for '{0}' in namespace '{1}'")]
    PodNotFound(String, String),
    #[error("CONJ00026E Kubernetes {0} {1} not found in namespace {2}")]
    ResourceNotFound(String, String, String),
    #[error("CONJ00042E Received invalid Kubernetes API url: '{0}'")]
    InvalidApiUrl(String),
    #[error("CONJ00043E No Kubernetes API certificate available")]
    MissingCertificate,
    #[error("CONJ00149E Invalid Kubernetes API certificate: {0}")]
    InvalidApiCert(String),
    #[error("CONJ00150E Kubernetes service account token is empty")]
    InvalidServiceAccountToken,
    #[error("CONJ00145E Invalid namespace label selector '{0}': {1}")]
    InvalidLabelSelector(String, String),
    #[error("CONJ00146E Namespace '{1}' labels do not match label selector '{0}'")]
    LabelSelectorMismatch(String, String),
    #[error(
        "CONJ00023E Namespace in SPIFFE ID '{0}' must match namespace implied by resource restriction: '{1}'"
    )]
    NamespaceMismatch(String, String),
    #[error("CONJ00060E Pod: {0} does not match: {1}.")]
    PodNameMismatch(String, String),
    #[error("CONJ00061E Pod: {0}, {1}: {2}, does not match: {3}.")]
    PodRelationMismatch(String, String, String, String),
    #[error("CONJ00062E Pod: {0} does not belong to a {1}.")]
    PodMissingRelation(String, String),
    #[error("access to {0} is forbidden")]
    Forbidden(String),
    #[error("kubernetes api returned {0}: {1}")]
    Status(u16, String),
    #[error("kubernetes api request failed: {0}")]
    Transport(String),
    #[error("failed to decode kubernetes object: {0}")]
    Decode(String),
    #[error("failed to load kubernetes configuration: {0}")]
    Config(String),
}

impl Error {
    /// The stable error code, for errors that are reported to the authenticating client.
    pub fn code(&self) -> Option<&'static str> {
        Some(match self {
            Error::PodNotFound(..) => "CONJ00024E",
            Error::ResourceNotFound(..) => "CONJ00026E",
            Error::InvalidApiUrl(_) => "CONJ00042E",
            Error::MissingCertificate => "CONJ00043E",
            Error::InvalidApiCert(_) => "CONJ00149E",
            Error::InvalidServiceAccountToken => "CONJ00150E",
            Error::InvalidLabelSelector(..) => "CONJ00145E",
            Error::LabelSelectorMismatch(..) => "CONJ00146E",
            Error::NamespaceMismatch(..) => "CONJ00023E",
            Error::PodNameMismatch(..) => "CONJ00060E",
            Error::PodRelationMismatch(..) => "CONJ00061E",
            Error::PodMissingRelation(..) => "CONJ00062E",
            _ => return None,
        })
    }
}

/// The kinds of object the authenticator reads. Besides the restriction types this includes
/// the intermediate owners walked when relating a pod to its controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Namespace,
    ServiceAccount,
    Pod,
    Deployment,
    ReplicaSet,
    StatefulSet,
    DeploymentConfig,
    ReplicationController,
}

impl Kind {
    /// The kind backing a resource restriction. Label selectors have no object of their own.
    pub fn for_resource(resource_type: ResourceType) -> Option<Kind> {
        match resource_type {
            ResourceType::Namespace => Some(Kind::Namespace),
            ResourceType::NamespaceLabelSelector => None,
            ResourceType::ServiceAccount => Some(Kind::ServiceAccount),
            ResourceType::Pod => Some(Kind::Pod),
            ResourceType::Deployment => Some(Kind::Deployment),
            ResourceType::StatefulSet => Some(Kind::StatefulSet),
            ResourceType::DeploymentConfig => Some(Kind::DeploymentConfig),
        }
    }

    /// The `kind` field as it appears in owner references.
    pub fn as_kind_str(&self) -> &'static str {
        match self {
            Kind::Namespace => "Namespace",
            Kind::ServiceAccount => "ServiceAccount",
            Kind::Pod => "Pod",
            Kind::Deployment => "Deployment",
            Kind::ReplicaSet => "ReplicaSet",
            Kind::StatefulSet => "StatefulSet",
            Kind::DeploymentConfig => "DeploymentConfig",
            Kind::ReplicationController => "ReplicationController",
        }
    }

    /// The API path of the named object, relative to the API server root.
    pub fn path(&self, name: &str, namespace: &str) -> String {
        let (group, plural) = match self {
            Kind::Namespace => return format!("/api/v1/namespaces/{name}"),
            Kind::ServiceAccount => ("api/v1", "serviceaccounts"),
            Kind::Pod => ("api/v1", "pods"),
            Kind::ReplicationController => ("api/v1", "replicationcontrollers"),
            Kind::Deployment => ("apis/apps/v1", "deployments"),
            Kind::ReplicaSet => ("apis/apps/v1", "replicasets"),
            Kind::StatefulSet => ("apis/apps/v1", "statefulsets"),
            Kind::DeploymentConfig => ("apis/apps.openshift.io/v1", "deploymentconfigs"),
        };
        format!("/{group}/namespaces/{namespace}/{plural}/{name}")
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Namespace => "namespace",
            Kind::ServiceAccount => "service account",
            Kind::Pod => "pod",
            Kind::Deployment => "deployment",
            Kind::ReplicaSet => "replica set",
            Kind::StatefulSet => "stateful set",
            Kind::DeploymentConfig => "deployment config",
            Kind::ReplicationController => "replication controller",
        })
    }
}

/// Lookup of live cluster state, plus the connection details needed to reach the API server
/// directly (for exec).
///
/// Objects are fetched fresh on every call. Absent objects are `Ok(None)`.
#[async_trait::async_trait]
pub trait K8sObjectLookup: Send + Sync {
    fn api_url(&self) -> &Url;

    fn bearer_token(&self) -> &str;

    /// PEM bundle trusted for the API server.
    fn ca_cert(&self) -> &str;

    fn connect_options(&self) -> ConnectOptions;

    async fn pod_by_name(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error>;

    async fn find_object_by_name(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ObjectMeta>, Error>;

    /// Labels of the namespace, or `None` if the namespace does not exist.
    async fn namespace_labels_hash(
        &self,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Kind::Namespace, "/api/v1/namespaces/n1"; "namespace")]
    #[test_case(Kind::Pod, "/api/v1/namespaces/ns/pods/n1"; "pod")]
    #[test_case(Kind::ServiceAccount, "/api/v1/namespaces/ns/serviceaccounts/n1"; "service account")]
    #[test_case(Kind::ReplicaSet, "/apis/apps/v1/namespaces/ns/replicasets/n1"; "replica set")]
    #[test_case(Kind::DeploymentConfig, "/apis/apps.openshift.io/v1/namespaces/ns/deploymentconfigs/n1"; "deployment config")]
    fn paths(kind: Kind, want: &str) {
        assert_eq!(kind.path("n1", "ns"), want);
    }

    #[test]
    fn resource_kinds() {
        assert_eq!(Kind::for_resource(ResourceType::NamespaceLabelSelector), None);
        assert_eq!(
            Kind::for_resource(ResourceType::StatefulSet),
            Some(Kind::StatefulSet)
        );
    }

    #[test]
    fn messages() {
        let err = Error::ResourceNotFound("deployment".into(), "d1".into(), "ns".into());
        assert_eq!(
            err.to_string(),
            "CONJ00026E Kubernetes deployment d1 not found in namespace ns"
        );
        assert_eq!(err.code(), Some("CONJ00026E"));
        assert_eq!(Error::Status(500, "x".into()).code(), None);
    }
}
