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

//! Issues a client certificate to a pod and copies it into the pod's authenticator container.

use tracing::{debug, info, instrument};

use crate::audit::{AuditEvent, AuditLog};
use crate::ca::{self, CaRepository};
use crate::conjur::{AccessCheck, ResourceRepository, Webservice};
use crate::exec::{
    self, Connector, ExecRequest, ExecuteCommandInContainer, MessageLog, WebSocketConnector,
};
use crate::identity::{self, K8sHost, SmartCsr, full_common_name};
use crate::k8s::{self, K8sObjectLookup};
use crate::validate::{self, PodRequest, ValidatePodRequest};

pub const CLIENT_CERT_PATH: &str = "/etc/conjur/ssl/client.pem";
pub const CLIENT_CERT_MODE: &str = "644";

const BLANK_ERROR_MESSAGE: &str = "The server returned a blank error message";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("CONJ00027E Certificate could not be copied to pod: {0}")]
    CertInstallation(String),
    #[error(transparent)]
    Identity(#[from] identity::Error),
    #[error(transparent)]
    Validation(#[from] validate::Error),
    #[error(transparent)]
    K8s(#[from] k8s::Error),
    #[error(transparent)]
    Ca(#[from] ca::Error),
    #[error(transparent)]
    Exec(#[from] exec::Error),
}

impl Error {
    /// The stable code of an authentication failure. Errors without one are internal.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::CertInstallation(_) => Some("CONJ00027E"),
            Error::Identity(e) => e.code(),
            Error::Validation(e) => e.code(),
            Error::K8s(e) => e.code(),
            Error::Ca(e) => e.code(),
            Error::Exec(e) => e.code(),
        }
    }
}

/// The POSIX shell script that writes `content` to `path` inside a container: written to a
/// temporary file first, then moved into place.
pub fn copy_script(path: &str, content: &str, mode: &str) -> String {
    let content = content.trim_end_matches('\n');
    format!(
        r#"#!/bin/sh
set -e
cleanup() {{ rm -f "{path}.tmp"; }}
trap cleanup EXIT
set_file_content() {{
  cat > "{path}.tmp" <<EOF
{content}
EOF
  chmod "{mode}" "{path}.tmp"
  mv "{path}.tmp" "{path}"
}}
if [ -w "${{TMPDIR:-/tmp}}" ]; then
  set_file_content > "${{TMPDIR:-/tmp}}/conjur_copy_text_output.log" 2>&1
else
  echo "WARNING: Log directory '${{TMPDIR:-/tmp}}' is not writeable. Running without logging." >&2
  set_file_content
fi
"#
    )
}

/// Maps the exec error channel onto the outcome of the copy.
pub fn check_error_stream(log: &MessageLog) -> Result<(), Error> {
    match log.error_text() {
        None => Ok(()),
        Some(text) if text.is_empty() => Ok(()),
        Some(text) if text.trim().is_empty() => {
            Err(Error::CertInstallation(BLANK_ERROR_MESSAGE.to_string()))
        }
        Some(text) => Err(Error::CertInstallation(text)),
    }
}

/// Everything one injection needs. Collaborators are borrowed for the duration of a request.
pub struct InjectClientCert<'a, C = WebSocketConnector> {
    pub resources: &'a dyn ResourceRepository,
    pub access: &'a dyn AccessCheck,
    pub lookup: &'a dyn K8sObjectLookup,
    pub ca: &'a dyn CaRepository,
    pub exec: &'a ExecuteCommandInContainer<C>,
    pub audit: &'a dyn AuditLog,
}

/// A certificate injection request.
#[derive(Clone, Debug, Default)]
pub struct InjectRequest<'a> {
    pub account: &'a str,
    pub service_id: &'a str,
    pub csr: &'a [u8],
    pub host_id_prefix: Option<&'a str>,
    pub client_ip: Option<&'a str>,
}

impl<C: Connector> InjectClientCert<'_, C> {
    /// Validates the pod behind the CSR, signs the CSR and installs the certificate in the
    /// pod. Every attempt is audited.
    #[instrument(name = "inject_client_cert", skip_all, fields(service_id = req.service_id))]
    pub async fn call(&self, req: &InjectRequest<'_>) -> Result<(), Error> {
        let mut host_id = None;
        let result = self.inject(req, &mut host_id).await;

        let role_id = match &host_id {
            Some(id) => match self.resources.resource(id).await {
                Ok(Some(_)) => Some(id.as_str()),
                _ => None,
            },
            None => None,
        };
        let error = result.as_ref().err().map(ToString::to_string);
        self.audit.log(AuditEvent::injection(
            req.service_id,
            role_id,
            req.client_ip,
            error,
        ));
        result
    }

    async fn inject(
        &self,
        req: &InjectRequest<'_>,
        host_id: &mut Option<String>,
    ) -> Result<(), Error> {
        let mut csr = SmartCsr::from_pem(req.csr)?;
        let spiffe_id = csr.spiffe_id()?;
        let common_name =
            full_common_name(req.host_id_prefix, req.service_id, csr.common_name()?);
        debug!(common_name, "setting common name");
        csr.set_common_name(common_name);

        let k8s_host = K8sHost::from_csr(req.account, &csr)?;
        *host_id = Some(k8s_host.conjur_host_id.clone());

        let webservice = Webservice::new(req.account, req.service_id);
        let pod_request = PodRequest {
            k8s_host,
            spiffe_id,
        };
        let restrictions = ValidatePodRequest {
            resources: self.resources,
            access: self.access,
            lookup: self.lookup,
        }
        .call(&webservice, &pod_request)
        .await?;

        let spiffe_id = &pod_request.spiffe_id;
        let ca = self.ca.ca(&webservice).await?;
        let cert = ca.sign(&csr, &[spiffe_id.to_altname()])?;
        let container = restrictions.container_name();
        debug!(
            container,
            path = CLIENT_CERT_PATH,
            namespace = spiffe_id.namespace(),
            pod = spiffe_id.name(),
            "copying client certificate to pod"
        );

        let script = copy_script(CLIENT_CERT_PATH, &cert, CLIENT_CERT_MODE);
        let log = self
            .exec
            .call(
                self.lookup,
                &ExecRequest {
                    namespace: spiffe_id.namespace(),
                    pod: spiffe_id.name(),
                    container,
                    cmds: &["sh", "-s"],
                    body: Some(&script),
                    stdin: true,
                },
            )
            .await?;
        check_error_stream(&log)?;
        info!(
            host = pod_request.k8s_host.conjur_host_id,
            "client certificate installed"
        );
        Ok(())
    }
}
