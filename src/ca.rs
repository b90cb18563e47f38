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

//! Signing of pod client certificates.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rcgen::string::Ia5String;
use rcgen::{
    CertificateSigningRequestParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use tracing::debug;

use crate::conjur::{self, SecretsProvider, Webservice};
use crate::identity::SmartCsr;

/// Lifetime of issued client certificates when not configured.
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

pub const CA_CERT_VARIABLE: &str = "ca/cert";
pub const CA_KEY_VARIABLE: &str = "ca/key";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CONJ00151E Invalid signing certificate: {0}")]
    InvalidSigningCert(String),
    #[error("CONJ00152E Invalid signing key: {0}")]
    InvalidSigningKey(String),
    #[error("CONJ00190W Missing required parameter: {0}")]
    MissingParameter(String),
    #[error("no CA configured for {0}")]
    NoCa(String),
    #[error("failed to sign certificate: {0}")]
    Signing(String),
    #[error(transparent)]
    Conjur(#[from] conjur::Error),
}

impl Error {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::InvalidSigningCert(_) => Some("CONJ00151E"),
            Error::InvalidSigningKey(_) => Some("CONJ00152E"),
            Error::MissingParameter(_) => Some("CONJ00190W"),
            Error::NoCa(_) | Error::Signing(_) => None,
            Error::Conjur(e) => e.code(),
        }
    }
}

pub trait CertificateAuthority: Send + Sync {
    /// Issues a PEM certificate for the CSR's key and common name, carrying the given
    /// subjectAltNames (`URI:<uri>` entries).
    fn sign(&self, csr: &SmartCsr, subject_altnames: &[String]) -> Result<String, Error>;
}

/// Resolves the CA that signs client certificates for a webservice.
#[async_trait::async_trait]
pub trait CaRepository: Send + Sync {
    async fn ca(&self, webservice: &Webservice) -> Result<Arc<dyn CertificateAuthority>, Error>;
}

/// A CA backed by a certificate and key held as PEM.
#[derive(Clone, Debug)]
pub struct ConjurCa {
    cert_pem: String,
    key_pem: String,
    ttl: Duration,
}

impl ConjurCa {
    pub fn from_pem(cert_pem: &str, key_pem: &str, ttl: Duration) -> Result<Self, Error> {
        let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidSigningCert(e.to_string()))?;
        if certs.len() != 1 {
            return Err(Error::InvalidSigningCert(format!(
                "expected exactly one certificate, found {}",
                certs.len()
            )));
        }
        let key = KeyPair::from_pem(key_pem).map_err(|e| Error::InvalidSigningKey(e.to_string()))?;
        Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| Error::InvalidSigningCert(e.to_string()))?;
        Ok(ConjurCa {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            ttl,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl CertificateAuthority for ConjurCa {
    fn sign(&self, csr: &SmartCsr, subject_altnames: &[String]) -> Result<String, Error> {
        let mut params = CertificateSigningRequestParams::from_pem(csr.pem())
            .map_err(|e| Error::Signing(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        let cn = csr.common_name().map_err(|e| Error::Signing(e.to_string()))?;
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        params.params.distinguished_name = dn;
        params.params.subject_alt_names = subject_altnames
            .iter()
            .map(|san| {
                let uri = san.strip_prefix("URI:").unwrap_or(san);
                Ia5String::try_from(uri.to_string())
                    .map(SanType::URI)
                    .map_err(|e| Error::Signing(format!("invalid SAN {san}: {e}")))
            })
            .collect::<Result<_, _>>()?;

        params.params.is_ca = IsCa::ExplicitNoCa;
        params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let now = SystemTime::now();
        params.params.not_before = now.into();
        params.params.not_after = (now + self.ttl).into();
        let mut serial: [u8; 16] = rand::random();
        serial[0] &= 0x7f;
        params.params.serial_number = Some(SerialNumber::from_slice(&serial));

        let key =
            KeyPair::from_pem(&self.key_pem).map_err(|e| Error::InvalidSigningKey(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, key)
            .map_err(|e| Error::InvalidSigningCert(e.to_string()))?;
        let cert = params
            .signed_by(&issuer)
            .map_err(|e| Error::Signing(e.to_string()))?;
        debug!(cn, "signed client certificate");
        Ok(cert.pem())
    }
}

/// A single CA shared by every webservice.
#[async_trait::async_trait]
impl CaRepository for ConjurCa {
    async fn ca(&self, _: &Webservice) -> Result<Arc<dyn CertificateAuthority>, Error> {
        Ok(Arc::new(self.clone()))
    }
}

/// Loads each webservice's CA from its `ca/cert` and `ca/key` variables. A webservice with
/// neither set is signed for by `fallback`.
pub struct SecretsCaRepository {
    secrets: Arc<dyn SecretsProvider>,
    ttl: Duration,
    fallback: Option<Arc<ConjurCa>>,
}

impl SecretsCaRepository {
    pub fn new(
        secrets: Arc<dyn SecretsProvider>,
        ttl: Duration,
        fallback: Option<ConjurCa>,
    ) -> Self {
        SecretsCaRepository {
            secrets,
            ttl,
            fallback: fallback.map(Arc::new),
        }
    }
}

#[async_trait::async_trait]
impl CaRepository for SecretsCaRepository {
    async fn ca(&self, webservice: &Webservice) -> Result<Arc<dyn CertificateAuthority>, Error> {
        let cert_id = webservice.variable_id(CA_CERT_VARIABLE);
        let key_id = webservice.variable_id(CA_KEY_VARIABLE);
        let cert = self.secrets.secret(&cert_id).await?;
        let key = self.secrets.secret(&key_id).await?;
        let ca: Arc<dyn CertificateAuthority> = match (cert, key) {
            (Some(cert), Some(key)) => {
                debug!(webservice = webservice.resource_id(), "using webservice CA");
                Arc::new(ConjurCa::from_pem(cert.trim(), key.trim(), self.ttl)?)
            }
            (None, None) => match &self.fallback {
                Some(ca) => ca.clone(),
                None => return Err(Error::NoCa(webservice.resource_id())),
            },
            (None, Some(_)) => return Err(Error::MissingParameter(cert_id)),
            (Some(_), None) => return Err(Error::MissingParameter(key_id)),
        };
        Ok(ca)
    }
}
