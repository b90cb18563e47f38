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

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use authn_k8s::audit::ROLE_NOT_FOUND;
use authn_k8s::ca::{
    CA_CERT_VARIABLE, CA_KEY_VARIABLE, CaRepository, ConjurCa, DEFAULT_CERT_TTL, SecretsCaRepository,
};
use authn_k8s::conjur::{Resource, StaticRegistry, Webservice};
use authn_k8s::exec::ExecuteCommandInContainer;
use authn_k8s::inject::{InjectClientCert, InjectRequest};
use authn_k8s::test_helpers::ca::{TestCa, csr_pem};
use authn_k8s::test_helpers::exec::{CERT_FILE, ExecServer};
use authn_k8s::test_helpers::k8s::{FakeK8s, pod};
use authn_k8s::test_helpers::{MemoryAuditLog, TempDir, helpers};

const HOST: &str = "acct:host:conjur/authn-k8s/svc/apps/ns/pod/p1";
const WEBSERVICE: &str = "acct:webservice:conjur/authn-k8s/svc";
const SPIFFE: &str = "spiffe://cluster.local/namespace/ns/pod/p1";

fn registry() -> StaticRegistry {
    let mut registry = StaticRegistry::default().with_enabled_authenticators(["authn-k8s/svc"]);
    for id in [WEBSERVICE, HOST] {
        registry.add_resource(Resource {
            id: id.to_string(),
            ..Default::default()
        });
    }
    registry.permit(HOST, "authenticate", WEBSERVICE);
    registry
}

struct Fixture {
    dir: TempDir,
    registry: StaticRegistry,
    k8s: FakeK8s,
    ca: Box<dyn CaRepository>,
    exec: ExecuteCommandInContainer,
    audit: MemoryAuditLog,
    server: ExecServer,
}

impl Fixture {
    async fn new() -> Fixture {
        helpers::initialize_telemetry();
        let dir = TempDir::new();
        let server = ExecServer::spawn(dir.path()).await;
        let mut k8s = FakeK8s::default().with_api_url(server.api_url());
        k8s.add_pod(pod("ns", "p1", &["app", "authenticator"]));
        let test_ca = TestCa::new("conjur-ca");
        let ca = ConjurCa::from_pem(&test_ca.cert_pem(), &test_ca.key_pem(), DEFAULT_CERT_TTL)
            .unwrap();
        Fixture {
            dir,
            registry: registry(),
            k8s,
            ca: Box::new(ca),
            exec: ExecuteCommandInContainer::new(Duration::from_secs(10)),
            audit: MemoryAuditLog::default(),
            server,
        }
    }

    async fn inject(&self, csr: &str) -> Result<(), authn_k8s::inject::Error> {
        InjectClientCert {
            resources: &self.registry,
            access: &self.registry,
            lookup: &self.k8s,
            ca: self.ca.as_ref(),
            exec: &self.exec,
            audit: &self.audit,
        }
        .call(&InjectRequest {
            account: "acct",
            service_id: "svc",
            csr: csr.as_bytes(),
            host_id_prefix: None,
            client_ip: Some("10.1.2.3"),
        })
        .await
    }
}

#[tokio::test]
async fn installs_certificate_in_pod() {
    let f = Fixture::new().await;
    f.inject(&csr_pem(Some("ns.pod.p1"), &[SPIFFE])).await.unwrap();

    let path = f.dir.path().join(CERT_FILE);
    let cert = std::fs::read_to_string(&path).unwrap();
    assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(cert.trim_end().ends_with("-----END CERTIFICATE-----"));
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644);
    assert!(!f.dir.path().join(format!("{CERT_FILE}.tmp")).exists());

    let requests = f.server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET /api/v1/namespaces/ns/pods/p1/exec?container=authenticator&"));
    assert!(requests[0].contains("command=sh&command=-s"));
    assert!(requests[0].contains("Bearer fake-token"));

    let events = f.audit.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].success());
    assert_eq!(events[0].role_id, HOST);
    assert_eq!(events[0].client_ip.as_deref(), Some("10.1.2.3"));
}

#[tokio::test]
async fn signs_with_webservice_ca() {
    let mut f = Fixture::new().await;
    let own = TestCa::new("svc-ca");
    let webservice = Webservice::new("acct", "svc");
    f.registry
        .set_secret(&webservice.variable_id(CA_CERT_VARIABLE), &own.cert_pem());
    f.registry
        .set_secret(&webservice.variable_id(CA_KEY_VARIABLE), &own.key_pem());
    f.ca = Box::new(SecretsCaRepository::new(
        Arc::new(f.registry.clone()),
        DEFAULT_CERT_TTL,
        None,
    ));
    f.inject(&csr_pem(Some("ns.pod.p1"), &[SPIFFE])).await.unwrap();

    let pem = std::fs::read_to_string(f.dir.path().join(CERT_FILE)).unwrap();
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
    let cert = parsed.parse_x509().unwrap();
    let issuer = cert.issuer().iter_common_name().next().unwrap();
    assert_eq!(issuer.as_str().unwrap(), "svc-ca");
}

#[tokio::test]
async fn repeated_injection_replaces_certificate() {
    let f = Fixture::new().await;
    let path = f.dir.path().join(CERT_FILE);

    f.inject(&csr_pem(Some("ns.pod.p1"), &[SPIFFE])).await.unwrap();
    let first = std::fs::read_to_string(&path).unwrap();
    f.inject(&csr_pem(Some("ns.pod.p1"), &[SPIFFE])).await.unwrap();
    let second = std::fs::read_to_string(&path).unwrap();

    assert_ne!(first, second);
    assert_eq!(f.server.requests().len(), 2);
    assert!(f.audit.events().iter().all(|e| e.success()));
}

#[tokio::test]
async fn missing_pod_never_execs() {
    let f = Fixture::new().await;
    let csr = csr_pem(
        Some("ns.pod.p1"),
        &["spiffe://cluster.local/namespace/ns/pod/gone"],
    );
    let err = f.inject(&csr).await.unwrap_err();
    assert_eq!(err.code(), Some("CONJ00024E"));
    assert!(f.server.requests().is_empty());
    assert!(!f.dir.path().join(CERT_FILE).exists());

    let events = f.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].role_id, HOST);
    assert!(events[0].error.as_deref().unwrap().starts_with("CONJ00024E"));
}

#[tokio::test]
async fn unknown_host_is_masked_in_audit() {
    let f = Fixture::new().await;
    let err = f
        .inject(&csr_pem(Some("ns.pod.other"), &[SPIFFE]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("CONJ00007E"));
    assert_eq!(f.audit.events()[0].role_id, ROLE_NOT_FOUND);
    assert!(f.server.requests().is_empty());
}

#[tokio::test]
async fn failed_copy_is_reported() {
    let f = Fixture::new().await;
    // A directory in place of the temporary file makes the write fail.
    let tmp = f.dir.path().join(format!("{CERT_FILE}.tmp"));
    std::fs::create_dir_all(tmp.join("occupied")).unwrap();

    let err = f
        .inject(&csr_pem(Some("ns.pod.p1"), &[SPIFFE]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("CONJ00027E"));
    assert!(
        err.to_string()
            .contains("command terminated with non-zero exit code"),
        "{err}"
    );
    assert!(!f.audit.events()[0].success());
    assert!(!f.dir.path().join(CERT_FILE).exists());
}
