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

//! The Conjur collaborators the authenticator depends on: policy resources, secrets and
//! access checks, plus a static in-memory implementation loaded from YAML.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const AUTHENTICATOR_NAME: &str = "authn-k8s";
pub const AUTHENTICATE_PRIVILEGE: &str = "authenticate";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CONJ00004E '{0}' is not enabled")]
    AuthenticatorNotWhitelisted(String),
    #[error("CONJ00005E Webservice '{0}' not found")]
    WebserviceNotFound(String),
    #[error("CONJ00006E '{0}' does not have '{1}' privilege on {2}")]
    RoleNotAuthorizedOnResource(String, String, String),
    #[error("CONJ00007E '{0}' not found")]
    RoleNotFound(String),
    #[error("failed to load registry: {0}")]
    Registry(String),
}

impl Error {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::AuthenticatorNotWhitelisted(_) => Some("CONJ00004E"),
            Error::WebserviceNotFound(_) => Some("CONJ00005E"),
            Error::RoleNotAuthorizedOnResource(..) => Some("CONJ00006E"),
            Error::RoleNotFound(_) => Some("CONJ00007E"),
            Error::Registry(_) => None,
        }
    }
}

/// The authn-k8s webservice for one service id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Webservice {
    pub account: String,
    pub service_id: String,
}

impl Webservice {
    pub fn new(account: impl Into<String>, service_id: impl Into<String>) -> Self {
        Webservice {
            account: account.into(),
            service_id: service_id.into(),
        }
    }

    /// `authn-k8s/<service_id>`, as listed in the enabled authenticators.
    pub fn authenticator_name(&self) -> String {
        format!("{AUTHENTICATOR_NAME}/{}", self.service_id)
    }

    pub fn resource_id(&self) -> String {
        format!(
            "{}:webservice:conjur/{AUTHENTICATOR_NAME}/{}",
            self.account, self.service_id
        )
    }

    /// A variable under the webservice's policy, e.g. `ca/cert`.
    pub fn variable_id(&self, name: &str) -> String {
        format!(
            "{}:variable:conjur/{AUTHENTICATOR_NAME}/{}/{name}",
            self.account, self.service_id
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[async_trait::async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn resource(&self, id: &str) -> Result<Option<Resource>, Error>;
}

#[async_trait::async_trait]
pub trait SecretsProvider: Send + Sync {
    /// The current value of a variable, or `None` if it has no value.
    async fn secret(&self, variable_id: &str) -> Result<Option<String>, Error>;
}

#[async_trait::async_trait]
pub trait AccessCheck: Send + Sync {
    /// Fails unless the webservice's authenticator is enabled and the webservice exists.
    async fn validate_webservice(&self, webservice: &Webservice) -> Result<(), Error>;

    /// Fails unless `role_id` holds `privilege` on `resource_id`.
    async fn validate_permission(
        &self,
        role_id: &str,
        resource_id: &str,
        privilege: &str,
    ) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permit {
    pub role: String,
    pub privilege: String,
    pub resource: String,
}

/// Policy and secrets held in memory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticRegistry {
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(default)]
    permits: Vec<Permit>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(skip)]
    enabled_authenticators: BTreeSet<String>,
}

impl StaticRegistry {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Registry(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Registry(format!("{}: {e}", path.display())))?;
        let registry = Self::from_yaml(&yaml)?;
        debug!(
            resources = registry.resources.len(),
            permits = registry.permits.len(),
            secrets = registry.secrets.len(),
            "loaded registry"
        );
        Ok(registry)
    }

    pub fn with_enabled_authenticators<I, S>(mut self, authenticators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_authenticators = authenticators.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.retain(|r| r.id != resource.id);
        self.resources.push(resource);
    }

    pub fn permit(&mut self, role: &str, privilege: &str, resource: &str) {
        self.permits.push(Permit {
            role: role.to_string(),
            privilege: privilege.to_string(),
            resource: resource.to_string(),
        });
    }

    pub fn set_secret(&mut self, variable_id: &str, value: &str) {
        self.secrets
            .insert(variable_id.to_string(), value.to_string());
    }

    fn find(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }
}

#[async_trait::async_trait]
impl ResourceRepository for StaticRegistry {
    async fn resource(&self, id: &str) -> Result<Option<Resource>, Error> {
        Ok(self.find(id).cloned())
    }
}

#[async_trait::async_trait]
impl SecretsProvider for StaticRegistry {
    async fn secret(&self, variable_id: &str) -> Result<Option<String>, Error> {
        Ok(self.secrets.get(variable_id).cloned())
    }
}

#[async_trait::async_trait]
impl AccessCheck for StaticRegistry {
    async fn validate_webservice(&self, webservice: &Webservice) -> Result<(), Error> {
        let name = webservice.authenticator_name();
        if !self.enabled_authenticators.contains(&name) {
            return Err(Error::AuthenticatorNotWhitelisted(name));
        }
        let id = webservice.resource_id();
        if self.find(&id).is_none() {
            return Err(Error::WebserviceNotFound(id));
        }
        Ok(())
    }

    async fn validate_permission(
        &self,
        role_id: &str,
        resource_id: &str,
        privilege: &str,
    ) -> Result<(), Error> {
        let permitted = self
            .permits
            .iter()
            .any(|p| p.role == role_id && p.resource == resource_id && p.privilege == privilege);
        if permitted {
            Ok(())
        } else {
            Err(Error::RoleNotAuthorizedOnResource(
                role_id.to_string(),
                privilege.to_string(),
                resource_id.to_string(),
            ))
        }
    }
}
