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

use super::{Error, SmartCsr};

/// The host-id prefix used when the caller does not supply one.
pub fn default_host_id_prefix(service_id: &str) -> String {
    format!("host.conjur.authn-k8s.{service_id}.apps")
}

/// Builds the common name a signed certificate will carry: `<prefix>.<common_name>`.
pub fn full_common_name(prefix: Option<&str>, service_id: &str, common_name: &str) -> String {
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}.{common_name}"),
        None => format!("{}.{common_name}", default_host_id_prefix(service_id)),
    }
}

/// The Conjur host a pod claims to be, derived from its CSR common name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct K8sHost {
    pub account: String,
    pub conjur_host_id: String,
    pub k8s_host_name: String,
}

impl K8sHost {
    pub fn from_csr(account: &str, csr: &SmartCsr) -> Result<Self, Error> {
        Ok(Self::from_common_name(account, csr.common_name()?))
    }

    pub fn from_common_name(account: &str, common_name: &str) -> Self {
        let host_name = common_name.replace('.', "/");
        let k8s_host_name = host_name
            .strip_prefix("host/")
            .unwrap_or(&host_name)
            .to_string();
        K8sHost {
            account: account.to_string(),
            conjur_host_id: format!("{account}:host:{k8s_host_name}"),
            k8s_host_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix() {
        let cn = full_common_name(None, "prod", "app-ns.service_account.app-sa");
        assert_eq!(
            cn,
            "host.conjur.authn-k8s.prod.apps.app-ns.service_account.app-sa"
        );
        let host = K8sHost::from_common_name("acct", &cn);
        assert_eq!(
            host.k8s_host_name,
            "conjur/authn-k8s/prod/apps/app-ns/service_account/app-sa"
        );
        assert_eq!(
            host.conjur_host_id,
            "acct:host:conjur/authn-k8s/prod/apps/app-ns/service_account/app-sa"
        );
    }

    #[test]
    fn explicit_prefix() {
        assert_eq!(
            full_common_name(Some("host.apps"), "prod", "ns.pod.p1"),
            "host.apps.ns.pod.p1"
        );
        assert_eq!(
            full_common_name(Some(""), "prod", "ns.pod.p1"),
            "host.conjur.authn-k8s.prod.apps.ns.pod.p1"
        );
    }
}
