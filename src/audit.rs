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

use tracing::info;

use crate::conjur::AUTHENTICATOR_NAME;

/// Role id recorded when the claimed host does not exist.
pub const ROLE_NOT_FOUND: &str = "not-found";

/// One certificate injection attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEvent {
    pub authenticator: &'static str,
    pub service_id: String,
    pub role_id: String,
    pub client_ip: Option<String>,
    pub error: Option<String>,
}

impl AuditEvent {
    /// `role_id` is `None` when the role could not be resolved; it is then masked.
    pub fn injection(
        service_id: &str,
        role_id: Option<&str>,
        client_ip: Option<&str>,
        error: Option<String>,
    ) -> Self {
        AuditEvent {
            authenticator: AUTHENTICATOR_NAME,
            service_id: service_id.to_string(),
            role_id: role_id.unwrap_or(ROLE_NOT_FOUND).to_string(),
            client_ip: client_ip.map(str::to_string),
            error,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

pub trait AuditLog: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log(&self, event: AuditEvent) {
        match &event.error {
            None => info!(
                target: "audit",
                authenticator = event.authenticator,
                service_id = event.service_id,
                role_id = event.role_id,
                client_ip = event.client_ip.as_deref(),
                success = true,
                "{} successfully injected client certificate",
                event.role_id
            ),
            Some(error) => info!(
                target: "audit",
                authenticator = event.authenticator,
                service_id = event.service_id,
                role_id = event.role_id,
                client_ip = event.client_ip.as_deref(),
                success = false,
                error,
                "{} failed to inject client certificate",
                event.role_id
            ),
        }
    }
}
