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

use std::io::Cursor;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{trace, warn};

use super::{ConnectOptions, Error, TlsVersion, VerifyMode};

// All crypto MUST be done via the below providers.

#[cfg(feature = "tls-aws-lc")]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

#[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

static NATIVE_ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for e in loaded.errors {
        warn!("failed to load native root certificate: {e}");
    }
    roots.add_parsable_certificates(loaded.certs);
    Arc::new(roots)
});

/// Builds a trust store from every certificate in a PEM bundle. Returns an error when the
/// bundle holds no usable certificate.
pub fn cert_store_from_pem(pem: &[u8]) -> Result<RootCertStore, String> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(ignored, "ignored unparsable certificates in bundle");
    }
    if added == 0 {
        return Err("no certificates found".to_string());
    }
    Ok(roots)
}

pub fn client_config(options: &ConnectOptions) -> Result<ClientConfig, Error> {
    let versions: &[&rustls::SupportedProtocolVersion] = match options.ssl_version {
        TlsVersion::Any => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls12 => &[&rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let verifier = PeerVerifier {
        roots: options
            .cert_store
            .clone()
            .unwrap_or_else(|| NATIVE_ROOTS.clone()),
        mode: options.verify_mode,
    };
    Ok(ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(versions)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

pub(super) async fn connect(
    tcp: TcpStream,
    server_name: &str,
    options: &ConnectOptions,
) -> Result<TlsStream<TcpStream>, Error> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| Error::InvalidServerName(server_name.to_string()))?;
    let config = client_config(options)?;
    tokio_rustls::TlsConnector::from(Arc::new(config))
        .connect(name, tcp)
        .await
        .map_err(Error::Handshake)
}

/// Verifies the peer chain against a fixed set of roots and, for DNS names, that the
/// certificate covers the name we dialed. IP literals are not checked against the SAN.
#[derive(Debug)]
struct PeerVerifier {
    roots: Arc<RootCertStore>,
    mode: VerifyMode,
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.mode == VerifyMode::None {
            return Ok(ServerCertVerified::assertion());
        }
        let cert = ParsedCertificate::try_from(end_entity)?;

        let algs = provider().signature_verification_algorithms;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            algs.all,
        )?;

        match server_name {
            ServerName::IpAddress(ip) => {
                trace!(?ip, "skipping hostname verification for ip address");
            }
            _ => rustls::client::verify_server_name(&cert, server_name)?,
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
