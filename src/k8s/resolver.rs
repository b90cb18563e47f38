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

//! Checks that a pod actually belongs to the Kubernetes resource a restriction names.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, instrument};

use super::{Error, K8sObjectLookup, Kind};
use crate::restrictions::{K8sResource, ResourceType};

/// Verifies that the restricted object exists in `namespace` and that `pod` is related to it.
#[instrument(skip(lookup, pod), fields(resource_type = %resource.resource_type, value = resource.value))]
pub async fn validate_resource(
    lookup: &dyn K8sObjectLookup,
    resource: &K8sResource,
    pod: &Pod,
    namespace: &str,
) -> Result<(), Error> {
    let Some(kind) = Kind::for_resource(resource.resource_type) else {
        return Ok(());
    };
    if kind == Kind::Namespace {
        return Ok(());
    }
    lookup
        .find_object_by_name(kind, &resource.value, namespace)
        .await?
        .ok_or_else(|| {
            Error::ResourceNotFound(
                kind.to_string(),
                resource.value.clone(),
                namespace.to_string(),
            )
        })?;
    validate_pod(lookup, resource, pod, namespace).await
}

async fn validate_pod(
    lookup: &dyn K8sObjectLookup,
    resource: &K8sResource,
    pod: &Pod,
    namespace: &str,
) -> Result<(), Error> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let expected = resource.value.as_str();
    let owner = match resource.resource_type {
        ResourceType::Namespace | ResourceType::NamespaceLabelSelector => return Ok(()),
        ResourceType::Pod => {
            return if pod_name == expected {
                Ok(())
            } else {
                Err(Error::PodNameMismatch(pod_name, expected.to_string()))
            };
        }
        ResourceType::ServiceAccount => {
            let actual = pod
                .spec
                .as_ref()
                .and_then(|s| s.service_account_name.clone())
                .unwrap_or_default();
            return check_relation(&pod_name, Kind::ServiceAccount, actual, expected);
        }
        ResourceType::StatefulSet => owner_name(&pod.metadata, Kind::StatefulSet, &pod_name)?,
        ResourceType::Deployment => {
            owner_via(lookup, pod, &pod_name, namespace, Kind::ReplicaSet, Kind::Deployment)
                .await?
        }
        ResourceType::DeploymentConfig => {
            owner_via(
                lookup,
                pod,
                &pod_name,
                namespace,
                Kind::ReplicationController,
                Kind::DeploymentConfig,
            )
            .await?
        }
    };
    let kind = Kind::for_resource(resource.resource_type).unwrap_or(Kind::Pod);
    check_relation(&pod_name, kind, owner, expected)
}

/// Walks pod -> `intermediate` -> `controller` through owner references.
async fn owner_via(
    lookup: &dyn K8sObjectLookup,
    pod: &Pod,
    pod_name: &str,
    namespace: &str,
    intermediate: Kind,
    controller: Kind,
) -> Result<String, Error> {
    let intermediate_name = owner_name(&pod.metadata, intermediate, pod_name)?;
    let object = lookup
        .find_object_by_name(intermediate, &intermediate_name, namespace)
        .await?
        .ok_or_else(|| {
            Error::ResourceNotFound(
                intermediate.to_string(),
                intermediate_name.clone(),
                namespace.to_string(),
            )
        })?;
    debug!(%intermediate, name = intermediate_name, "found pod owner");
    owner_name(&object, controller, pod_name)
}

fn owner_name(meta: &ObjectMeta, kind: Kind, pod_name: &str) -> Result<String, Error> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.kind == kind.as_kind_str())
        .map(|r| r.name.clone())
        .ok_or_else(|| Error::PodMissingRelation(pod_name.to_string(), kind.as_kind_str().to_string()))
}

fn check_relation(pod_name: &str, kind: Kind, actual: String, expected: &str) -> Result<(), Error> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::PodRelationMismatch(
            pod_name.to_string(),
            kind.to_string(),
            actual,
            expected.to_string(),
        ))
    }
}
