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

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog, TracingAuditLog};
use crate::ca::{CaRepository, ConjurCa, SecretsCaRepository};
use crate::config::{Config, ProxyConfig};
use crate::conjur::StaticRegistry;
use crate::exec::ExecuteCommandInContainer;
use crate::inject::{self, InjectClientCert, InjectRequest};
use crate::k8s::{self, KubeClient, config::InCluster};
use crate::server::{self, Injector};
use crate::{hyper_util, signal};

/// Live collaborators for one injection: the Conjur registry, the signing CAs and a Kubernetes
/// client built per request from the webservice's configuration.
pub struct Authenticator {
    registry: Arc<StaticRegistry>,
    ca: Arc<dyn CaRepository>,
    exec: ExecuteCommandInContainer,
    in_cluster: InCluster,
    proxy: ProxyConfig,
    audit: Arc<dyn AuditLog>,
}

impl Authenticator {
    pub fn new(
        config: &Config,
        registry: Arc<StaticRegistry>,
        ca: Arc<dyn CaRepository>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Authenticator {
            registry,
            ca,
            exec: ExecuteCommandInContainer::new(config.exec_timeout),
            in_cluster: InCluster::new(
                config.kubernetes_service_host.clone(),
                config.kubernetes_service_port.clone(),
            ),
            proxy: config.proxy.clone(),
            audit,
        }
    }

    async fn kube_client(&self, req: &InjectRequest<'_>) -> Result<KubeClient, k8s::Error> {
        let api = k8s::config::load(
            self.registry.as_ref(),
            req.account,
            Some(req.service_id),
            &self.in_cluster,
        )
        .await?;
        let proxy = self.proxy.for_url(&api.api_url);
        KubeClient::new(api, proxy)
    }
}

#[async_trait::async_trait]
impl Injector for Authenticator {
    async fn inject(&self, req: &InjectRequest<'_>) -> Result<(), inject::Error> {
        let client = match self.kube_client(req).await {
            Ok(client) => client,
            Err(e) => {
                self.audit.log(AuditEvent::injection(
                    req.service_id,
                    None,
                    req.client_ip,
                    Some(e.to_string()),
                ));
                return Err(e.into());
            }
        };
        InjectClientCert {
            resources: self.registry.as_ref(),
            access: self.registry.as_ref(),
            lookup: &client,
            ca: self.ca.as_ref(),
            exec: &self.exec,
            audit: self.audit.as_ref(),
        }
        .call(req)
        .await
    }
}

fn load_registry(config: &Config) -> anyhow::Result<StaticRegistry> {
    let registry = match &config.registry {
        Some(path) => StaticRegistry::load(path)
            .with_context(|| format!("failed to load registry {}", path.display()))?,
        None => {
            warn!("no registry configured, every webservice lookup will fail");
            StaticRegistry::default()
        }
    };
    Ok(registry.with_enabled_authenticators(config.authenticators.iter()))
}

/// The CA for webservices without their own `ca/cert` and `ca/key` variables.
fn load_fallback_ca(config: &Config) -> anyhow::Result<Option<ConjurCa>> {
    let (cert, key) = match (&config.ca_cert, &config.ca_key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => {
            warn!("no fallback CA configured, only webservices with their own CA can sign");
            return Ok(None);
        }
        _ => anyhow::bail!("AUTHN_K8S_CA_CERT and AUTHN_K8S_CA_KEY must both be set"),
    };
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    };
    Ok(Some(ConjurCa::from_pem(&read(cert)?, &read(key)?, config.cert_ttl)?))
}

pub async fn build(config: Config) -> anyhow::Result<Bound> {
    let registry = Arc::new(load_registry(&config)?);
    let ca = Arc::new(SecretsCaRepository::new(
        registry.clone(),
        config.cert_ttl,
        load_fallback_ca(&config)?,
    ));
    let authenticator = Authenticator::new(&config, registry, ca, Arc::new(TracingAuditLog));
    build_with_injector(config, authenticator).await
}

pub async fn build_with_injector(
    config: Config,
    injector: impl Injector + 'static,
) -> anyhow::Result<Bound> {
    let shutdown = signal::Shutdown::new();
    let (drain_tx, drain_rx) = hyper_util::drain_channel();

    let service = server::Service::new(
        config.listen_addr,
        config.account.clone(),
        injector,
        shutdown.trigger(),
        drain_rx,
    )
    .await
    .context("authn-k8s server starts")?;
    let address = service.address();
    let server_task = service.spawn();

    Ok(Bound {
        address,
        shutdown,
        config,
        drain_tx,
        server_task,
    })
}

pub struct Bound {
    pub address: SocketAddr,
    pub shutdown: signal::Shutdown,

    config: Config,
    drain_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        self.shutdown.wait().await;

        // Stop accepting and give in-flight injections the grace period to finish.
        let _ = self.drain_tx.send(true);
        match time::timeout(self.config.termination_grace_period, self.server_task).await {
            Ok(_) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                self.config.termination_grace_period
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_helpers::{self, ca::TestCa};

    fn config(dir: &test_helpers::TempDir, ca: &TestCa) -> Config {
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca.key");
        let registry = dir.path().join("registry.yaml");
        std::fs::write(&cert, ca.cert_pem()).unwrap();
        std::fs::write(&key, ca.key_pem()).unwrap();
        std::fs::write(&registry, "resources: []\n").unwrap();
        Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            account: "acct".to_string(),
            authenticators: vec!["authn-k8s/svc".to_string()],
            registry: Some(registry),
            ca_cert: Some(cert),
            ca_key: Some(key),
            cert_ttl: crate::ca::DEFAULT_CERT_TTL,
            exec_timeout: crate::exec::DEFAULT_TIMEOUT,
            kubernetes_service_host: None,
            kubernetes_service_port: None,
            proxy: ProxyConfig::default(),
            termination_grace_period: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn build_and_shutdown() {
        let dir = test_helpers::TempDir::new();
        let ca = TestCa::new("conjur-ca");
        let bound = build(config(&dir, &ca)).await.unwrap();
        let addr = bound.address;
        tokio::net::TcpStream::connect(addr).await.unwrap();

        let trigger = bound.shutdown.trigger();
        let done = tokio::spawn(bound.wait_termination());
        trigger.shutdown_now().await;
        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn half_configured_ca_fails() {
        let dir = test_helpers::TempDir::new();
        let mut config = config(&dir, &TestCa::new("conjur-ca"));
        config.ca_key = None;
        assert!(build(config).await.is_err());
    }

    #[test]
    fn fallback_ca_is_optional() {
        let dir = test_helpers::TempDir::new();
        let ca = TestCa::new("conjur-ca");
        let mut config = config(&dir, &ca);
        let fallback = load_fallback_ca(&config).unwrap().unwrap();
        assert_eq!(fallback.cert_pem(), ca.cert_pem());
        config.ca_cert = None;
        config.ca_key = None;
        assert!(load_fallback_ca(&config).unwrap().is_none());
    }
}
