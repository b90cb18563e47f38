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

//! Where the Kubernetes API lives and how to authenticate to it.
//!
//! Two sources are supported: the service-account files mounted into an in-cluster pod, and
//! variables stored in Conjur under the authenticator's webservice. The
//! `kubernetes/config-precedence` variable selects between them when both are available.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use url::Url;

use super::Error;
use crate::conjur::SecretsProvider;

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const API_URL: &str = "api-url";
const CA_CERT: &str = "ca-cert";
const SERVICE_ACCOUNT_TOKEN: &str = "service-account-token";
const CONFIG_PRECEDENCE: &str = "config-precedence";

/// Validated API server connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    pub api_url: Url,
    pub ca_cert: String,
    pub token: String,
}

impl ApiConfig {
    pub fn new(api_url: &str, ca_cert: &str, token: &str) -> Result<Self, Error> {
        let api_url = api_url.trim();
        let url = Url::parse(api_url).map_err(|_| Error::InvalidApiUrl(api_url.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
            return Err(Error::InvalidApiUrl(api_url.to_string()));
        }
        let ca_cert = ca_cert.trim();
        if ca_cert.is_empty() {
            return Err(Error::MissingCertificate);
        }
        crate::socket::cert_store_from_pem(ca_cert.as_bytes()).map_err(Error::InvalidApiCert)?;
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidServiceAccountToken);
        }
        Ok(ApiConfig {
            api_url: url,
            ca_cert: ca_cert.to_string(),
            token: token.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precedence {
    /// Prefer the in-cluster files, falling back to Conjur variables.
    #[default]
    Files,
    Conjur,
}

impl Precedence {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("conjur") => Precedence::Conjur,
            _ => Precedence::Files,
        }
    }
}

/// The in-cluster environment: the API service location and the mounted service-account files.
#[derive(Clone, Debug, Default)]
pub struct InCluster {
    pub service_host: Option<String>,
    pub service_port: Option<String>,
    pub service_account_dir: PathBuf,
}

impl InCluster {
    pub fn new(service_host: Option<String>, service_port: Option<String>) -> Self {
        InCluster {
            service_host,
            service_port,
            service_account_dir: PathBuf::from(SERVICE_ACCOUNT_DIR),
        }
    }

    async fn load(&self) -> Option<ApiConfig> {
        let host = self.service_host.as_deref()?;
        let port = self.service_port.as_deref().unwrap_or("443");
        let ca = read_trimmed(&self.service_account_dir.join("ca.crt")).await?;
        let token = read_trimmed(&self.service_account_dir.join("token")).await?;
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        match ApiConfig::new(&format!("https://{authority}"), &ca, &token) {
            Ok(config) => Some(config),
            Err(e) => {
                debug!("ignoring in-cluster kubernetes config: {e}");
                None
            }
        }
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn variable_id(account: &str, service_id: &str, name: &str) -> String {
    format!("{account}:variable:conjur/authn-k8s/{service_id}/kubernetes/{name}")
}

/// Resolves the API configuration for a webservice. Without a webservice only the in-cluster
/// files can be used.
pub async fn load(
    secrets: &dyn SecretsProvider,
    account: &str,
    service_id: Option<&str>,
    in_cluster: &InCluster,
) -> Result<ApiConfig, Error> {
    let Some(service_id) = service_id else {
        return in_cluster.load().await.ok_or(Error::MissingCertificate);
    };
    let secret = |name: &'static str| async move {
        secrets
            .secret(&variable_id(account, service_id, name))
            .await
            .map_err(|e| Error::Config(e.to_string()))
    };

    let precedence = Precedence::parse(secret(CONFIG_PRECEDENCE).await?.as_deref());
    if precedence == Precedence::Files {
        if let Some(config) = in_cluster.load().await {
            debug!("using in-cluster kubernetes config");
            return Ok(config);
        }
    }

    info!(service_id, ?precedence, "using kubernetes config stored in conjur");
    let ca_cert = secret(CA_CERT).await?.ok_or(Error::MissingCertificate)?;
    let api_url = secret(API_URL)
        .await?
        .ok_or_else(|| Error::InvalidApiUrl(String::new()))?;
    let token = secret(SERVICE_ACCOUNT_TOKEN)
        .await?
        .ok_or(Error::InvalidServiceAccountToken)?;
    ApiConfig::new(&api_url, &ca_cert, &token)
}
