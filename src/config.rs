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

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::ca::DEFAULT_CERT_TTL;
use crate::exec;

const KUBE_EXEC_COMMAND_TIMEOUT: &str = "KUBE_EXEC_COMMAND_TIMEOUT";
const CONJUR_ACCOUNT: &str = "CONJUR_ACCOUNT";
const CONJUR_AUTHENTICATORS: &str = "CONJUR_AUTHENTICATORS";
const LISTEN_ADDR: &str = "AUTHN_K8S_LISTEN_ADDR";
const REGISTRY: &str = "AUTHN_K8S_REGISTRY";
const CA_CERT: &str = "AUTHN_K8S_CA_CERT";
const CA_KEY: &str = "AUTHN_K8S_CA_KEY";
const CERT_TTL: &str = "AUTHN_K8S_CERT_TTL";
const KUBERNETES_SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";
const KUBERNETES_SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";

const DEFAULT_ACCOUNT: &str = "default";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub account: String,
    /// Enabled authenticators, `authn-k8s/<service-id>`.
    pub authenticators: Vec<String>,
    /// YAML file holding policy resources, permits and secrets.
    pub registry: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
    pub cert_ttl: Duration,
    pub exec_timeout: Duration,
    pub kubernetes_service_host: Option<String>,
    pub kubernetes_service_port: Option<String>,
    pub proxy: ProxyConfig,
    pub termination_grace_period: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// Proxies for outbound connections, from the conventional environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub https_proxy: Option<Url>,
    pub http_proxy: Option<Url>,
}

impl ProxyConfig {
    /// The proxy to use when connecting to `url`.
    pub fn for_url(&self, url: &Url) -> Option<Url> {
        match url.scheme() {
            "https" | "wss" => self.https_proxy.clone(),
            _ => self.http_proxy.clone(),
        }
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

/// Reads the first of `envs` that is set and non-empty.
fn parse_first<T: FromStr>(envs: &[&str]) -> Result<Option<T>, Error> {
    for env in envs {
        if std::env::var(env).is_ok_and(|v| !v.is_empty()) {
            return parse(env);
        }
    }
    Ok(None)
}

/// The exec timeout is lenient: an unparsable value is reported and the default used.
fn parse_exec_timeout() -> Duration {
    match parse::<u64>(KUBE_EXEC_COMMAND_TIMEOUT) {
        Ok(Some(secs)) => Duration::from_secs(secs),
        Ok(None) => exec::DEFAULT_TIMEOUT,
        Err(e) => {
            warn!(
                "{e}: using the default exec timeout of {} seconds",
                exec::DEFAULT_TIMEOUT.as_secs()
            );
            exec::DEFAULT_TIMEOUT
        }
    }
}

fn parse_list(env: &str) -> Vec<String> {
    std::env::var(env)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_config() -> Result<Config, Error> {
    Ok(Config {
        listen_addr: parse_default(
            LISTEN_ADDR,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_PORT),
        )?,
        account: parse_default(CONJUR_ACCOUNT, DEFAULT_ACCOUNT.to_string())?,
        authenticators: parse_list(CONJUR_AUTHENTICATORS),
        registry: parse(REGISTRY)?,
        ca_cert: parse(CA_CERT)?,
        ca_key: parse(CA_KEY)?,
        cert_ttl: parse(CERT_TTL)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CERT_TTL),
        exec_timeout: parse_exec_timeout(),
        kubernetes_service_host: parse(KUBERNETES_SERVICE_HOST)?,
        kubernetes_service_port: parse(KUBERNETES_SERVICE_PORT)?,
        proxy: ProxyConfig {
            https_proxy: parse_first(&["https_proxy", "HTTPS_PROXY"])?,
            http_proxy: parse_first(&["http_proxy", "HTTP_PROXY"])?,
        },
        termination_grace_period: parse(TERMINATION_GRACE_PERIOD)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DRAIN_DURATION),
    })
}
