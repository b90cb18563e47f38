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

//! Decides whether a pod may authenticate as the Conjur host named in its CSR.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument};

use crate::conjur::{self, AUTHENTICATE_PRIVILEGE, AccessCheck, ResourceRepository, Webservice};
use crate::identity::{K8sHost, SpiffeId};
use crate::k8s::{self, K8sObjectLookup, K8sResourceValidator, resolver};
use crate::restrictions::{self, ResourceRestrictions, restriction_host_id};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CONJ00028E Container {0} was not found in the pod. Host id: {1}")]
    ContainerNotFound(String, String),
    #[error(transparent)]
    Conjur(#[from] conjur::Error),
    #[error(transparent)]
    K8s(#[from] k8s::Error),
    #[error(transparent)]
    Restrictions(#[from] restrictions::Error),
}

impl Error {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::ContainerNotFound(..) => Some("CONJ00028E"),
            Error::Conjur(e) => e.code(),
            Error::K8s(e) => e.code(),
            Error::Restrictions(e) => Some(e.code()),
        }
    }
}

/// A pod's claim: the host it wants to be, and the pod it says it is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRequest {
    pub k8s_host: K8sHost,
    pub spiffe_id: SpiffeId,
}

pub struct ValidatePodRequest<'a> {
    pub resources: &'a dyn ResourceRepository,
    pub access: &'a dyn AccessCheck,
    pub lookup: &'a dyn K8sObjectLookup,
}

impl ValidatePodRequest<'_> {
    /// Runs every check in order, stopping at the first failure. On success returns the
    /// restrictions the pod was validated against.
    #[instrument(name = "validate_pod_request", skip_all, fields(host = req.k8s_host.conjur_host_id, pod = %req.spiffe_id))]
    pub async fn call(
        &self,
        webservice: &Webservice,
        req: &PodRequest,
    ) -> Result<ResourceRestrictions, Error> {
        let host_id = &req.k8s_host.conjur_host_id;
        let role = self
            .resources
            .resource(host_id)
            .await?
            .ok_or_else(|| conjur::Error::RoleNotFound(host_id.clone()))?;

        self.access.validate_webservice(webservice).await?;
        self.access
            .validate_permission(host_id, &webservice.resource_id(), AUTHENTICATE_PRIVILEGE)
            .await?;

        let spiffe = &req.spiffe_id;
        let pod = self
            .lookup
            .pod_by_name(spiffe.name(), spiffe.namespace())
            .await?
            .ok_or_else(|| {
                k8s::Error::PodNotFound(spiffe.name().to_string(), spiffe.namespace().to_string())
            })?;

        let restrictions = ResourceRestrictions::parse(
            &restriction_host_id(&req.k8s_host.k8s_host_name),
            &role.annotations,
            &webservice.service_id,
        )?;
        self.validate_restrictions(&restrictions, spiffe, &pod).await?;

        let container = restrictions.container_name();
        if !has_container(&pod, container) {
            return Err(Error::ContainerNotFound(
                container.to_string(),
                host_id.clone(),
            ));
        }
        info!(container, "pod request is valid");
        Ok(restrictions)
    }

    async fn validate_restrictions(
        &self,
        restrictions: &ResourceRestrictions,
        spiffe: &SpiffeId,
        pod: &Pod,
    ) -> Result<(), k8s::Error> {
        let namespace = spiffe.namespace();
        if let Some(expected) = restrictions.namespace() {
            if expected != namespace {
                return Err(k8s::Error::NamespaceMismatch(
                    namespace.to_string(),
                    expected.to_string(),
                ));
            }
        }
        if let Some(selector) = restrictions.namespace_label_selector() {
            K8sResourceValidator::new(self.lookup, namespace)
                .valid_namespace(selector)
                .await?;
        }
        if restrictions.is_namespace_scoped() {
            debug!("namespace scoped host");
            return Ok(());
        }
        for resource in restrictions
            .resources()
            .iter()
            .filter(|r| !r.resource_type.is_namespace())
        {
            resolver::validate_resource(self.lookup, resource, pod, namespace).await?;
        }
        Ok(())
    }
}

fn has_container(pod: &Pod, name: &str) -> bool {
    let Some(spec) = &pod.spec else {
        return false;
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .any(|c| c.name == name)
}
