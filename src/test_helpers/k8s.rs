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

//! An in-memory Kubernetes API.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use url::Url;

use crate::k8s::{Error, K8sObjectLookup, Kind};
use crate::socket::ConnectOptions;

pub const FAKE_TOKEN: &str = "fake-token";

pub struct FakeK8s {
    api_url: Url,
    pods: HashMap<(String, String), Pod>,
    objects: HashMap<(Kind, String, String), ObjectMeta>,
    namespaces: HashMap<String, BTreeMap<String, String>>,
}

impl Default for FakeK8s {
    fn default() -> Self {
        FakeK8s {
            api_url: Url::parse("https://k8s.example").unwrap(),
            pods: HashMap::new(),
            objects: HashMap::new(),
            namespaces: HashMap::new(),
        }
    }
}

impl FakeK8s {
    /// Points exec sessions at a test server.
    pub fn with_api_url(mut self, api_url: Url) -> Self {
        self.api_url = api_url;
        self
    }

    /// Adds the pod, which is also visible as a `Pod` object.
    pub fn add_pod(&mut self, pod: Pod) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.objects.insert(
            (Kind::Pod, namespace.clone(), name.clone()),
            pod.metadata.clone(),
        );
        self.pods.insert((namespace, name), pod);
    }

    pub fn add_object(
        &mut self,
        kind: Kind,
        namespace: &str,
        name: &str,
        owners: Vec<OwnerReference>,
    ) {
        let meta = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: (!owners.is_empty()).then_some(owners),
            ..Default::default()
        };
        self.objects
            .insert((kind, namespace.to_string(), name.to_string()), meta);
    }

    pub fn add_namespace(&mut self, namespace: &str, labels: &[(&str, &str)]) {
        self.namespaces.insert(
            namespace.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl K8sObjectLookup for FakeK8s {
    fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn bearer_token(&self) -> &str {
        FAKE_TOKEN
    }

    fn ca_cert(&self) -> &str {
        ""
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default()
    }

    async fn pod_by_name(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(namespace, name))
    }

    async fn find_object_by_name(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ObjectMeta>, Error> {
        if kind == Kind::Namespace {
            return Ok(self.namespaces.contains_key(name).then(|| ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            }));
        }
        Ok(self
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn namespace_labels_hash(
        &self,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        Ok(self.namespaces.get(namespace).cloned())
    }
}

/// A pod with the named containers.
pub fn pod(namespace: &str, name: &str, containers: &[&str]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|c| Container {
                    name: c.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A controller owner reference.
pub fn owned_by(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        controller: Some(true),
        ..Default::default()
    }
}
