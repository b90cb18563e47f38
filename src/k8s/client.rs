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

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace};
use url::Url;

use super::config::ApiConfig;
use super::{Error, K8sObjectLookup, Kind};
use crate::socket::{self, ConnectOptions};

/// A Kubernetes API client speaking HTTP/1.1 over the crate's own socket layer, so that
/// API calls honor the same proxy and TLS settings as exec sessions.
#[derive(Clone, Debug)]
pub struct KubeClient {
    config: ApiConfig,
    options: ConnectOptions,
}

#[derive(Deserialize)]
struct Object {
    #[serde(default)]
    metadata: ObjectMeta,
}

impl KubeClient {
    pub fn new(config: ApiConfig, http_proxy_uri: Option<Url>) -> Result<Self, Error> {
        let store = socket::cert_store_from_pem(config.ca_cert.as_bytes())
            .map_err(Error::InvalidApiCert)?;
        let options = ConnectOptions {
            cert_store: Some(Arc::new(store)),
            http_proxy_uri,
            ..Default::default()
        };
        Ok(KubeClient { config, options })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        let base = self.config.api_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}")).map_err(|e| Error::InvalidApiUrl(e.to_string()))
    }

    /// Fetches and decodes one object. A 404 is `Ok(None)`.
    #[instrument(skip(self), level = "debug")]
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        let url = self.url(path)?;
        let stream = socket::connect(&url, &self.options)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("kubernetes api connection closed: {e}");
            }
        });

        let host = socket::authority(
            &socket::host_of(&url).map_err(|e| Error::InvalidApiUrl(e.to_string()))?,
            socket::port_of(&url).map_err(|e| Error::InvalidApiUrl(e.to_string()))?,
        );
        let target = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };
        let req = Request::builder()
            .method(Method::GET)
            .uri(target)
            .header(header::HOST, host)
            .header(header::ACCEPT, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.config.token),
            )
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::Transport(e.to_string()))?;
        let res = sender
            .send_request(req)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = res.status();
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .to_bytes();
        trace!(%status, len = body.len(), "response");

        match status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => Err(Error::Forbidden(path.to_string())),
            s if s.is_success() => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| Error::Decode(e.to_string())),
            s => Err(Error::Status(
                s.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl K8sObjectLookup for KubeClient {
    fn api_url(&self) -> &Url {
        &self.config.api_url
    }

    fn bearer_token(&self) -> &str {
        &self.config.token
    }

    fn ca_cert(&self) -> &str {
        &self.config.ca_cert
    }

    fn connect_options(&self) -> ConnectOptions {
        self.options.clone()
    }

    #[instrument(skip(self))]
    async fn pod_by_name(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error> {
        self.get(&Kind::Pod.path(name, namespace)).await
    }

    #[instrument(skip(self))]
    async fn find_object_by_name(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ObjectMeta>, Error> {
        let object: Option<Object> = self.get(&kind.path(name, namespace)).await?;
        Ok(object.map(|o| o.metadata))
    }

    #[instrument(skip(self))]
    async fn namespace_labels_hash(
        &self,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let object: Option<Object> = self.get(&Kind::Namespace.path(namespace, "")).await?;
        Ok(object.map(|o| o.metadata.labels.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ca::TestCa;
    use crate::test_helpers::http::{FakeApiServer, Reply};

    fn client(ca: &TestCa, addr: std::net::SocketAddr) -> KubeClient {
        let config = ApiConfig::new(
            &format!("https://localhost:{}", addr.port()),
            &ca.cert_pem(),
            "sa-token",
        )
        .unwrap();
        KubeClient::new(config, None).unwrap()
    }

    #[tokio::test]
    async fn pod_lookup() {
        let ca = TestCa::new("k8s-ca");
        let server = FakeApiServer::spawn(
            ca.server_config(&["localhost"]),
            vec![Reply::json(
                200,
                r#"{"metadata":{"name":"p1","namespace":"ns"},"spec":{"containers":[{"name":"authenticator"}]}}"#,
            )],
        )
        .await;
        let pod = client(&ca, server.addr)
            .pod_by_name("p1", "ns")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("p1"));
        let seen = server.requests().await;
        assert!(seen[0].starts_with("GET /api/v1/namespaces/ns/pods/p1 HTTP/1.1\r\n"));
        assert!(seen[0].to_ascii_lowercase().contains("authorization: bearer sa-token\r\n"));
    }

    #[tokio::test]
    async fn absent_and_forbidden() {
        let ca = TestCa::new("k8s-ca");
        let server = FakeApiServer::spawn(
            ca.server_config(&["localhost"]),
            vec![Reply::json(404, "{}"), Reply::json(403, "{}"), Reply::json(500, "boom")],
        )
        .await;
        let client = client(&ca, server.addr);
        assert_eq!(
            client
                .find_object_by_name(Kind::Deployment, "d1", "ns")
                .await
                .unwrap(),
            None
        );
        assert!(matches!(
            client.find_object_by_name(Kind::Deployment, "d1", "ns").await,
            Err(Error::Forbidden(_))
        ));
        assert_eq!(
            client.namespace_labels_hash("ns").await,
            Err(Error::Status(500, "boom".to_string()))
        );
    }

    #[tokio::test]
    async fn namespace_labels() {
        let ca = TestCa::new("k8s-ca");
        let server = FakeApiServer::spawn(
            ca.server_config(&["localhost"]),
            vec![Reply::json(
                200,
                r#"{"metadata":{"name":"ns","labels":{"team":"a"}}}"#,
            )],
        )
        .await;
        let labels = client(&ca, server.addr)
            .namespace_labels_hash("ns")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("a"));
        let seen = server.requests().await;
        assert!(seen[0].starts_with("GET /api/v1/namespaces/ns HTTP/1.1\r\n"));
    }
}
