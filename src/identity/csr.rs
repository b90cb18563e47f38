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

use rustls_pemfile::Item;
use x509_parser::prelude::*;

use super::{Error, SpiffeId};

/// A parsed and signature-verified certificate signing request.
///
/// The subject common name can be overridden before the request is handed to a signer; the
/// override never touches the encoded request itself.
#[derive(Clone, Debug)]
pub struct SmartCsr {
    pem: String,
    subject: String,
    common_name: Option<String>,
    uri_sans: Vec<String>,
}

impl SmartCsr {
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let mut reader = std::io::BufReader::new(Cursor::new(pem));
        let der = match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::Csr(der))) => der,
            Ok(_) => {
                return Err(Error::CsrParse(
                    "body is not a PEM encoded CERTIFICATE REQUEST".to_string(),
                ));
            }
            Err(e) => return Err(Error::CsrParse(e.to_string())),
        };
        let pem = String::from_utf8_lossy(pem).trim().to_string();
        Self::parse(pem, der.as_ref())
    }

    fn parse(pem: String, der: &[u8]) -> Result<Self, Error> {
        let (_, csr) =
            X509CertificationRequest::from_der(der).map_err(|e| Error::CsrParse(e.to_string()))?;
        csr.verify_signature()
            .map_err(|_| Error::CsrVerification("CSR can not be verified".to_string()))?;

        let info = &csr.certification_request_info;
        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let mut uri_sans = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    for name in &san.general_names {
                        if let GeneralName::URI(uri) = name {
                            uri_sans.push(uri.to_string());
                        }
                    }
                }
            }
        }

        Ok(SmartCsr {
            pem,
            subject: info.subject.to_string(),
            common_name,
            uri_sans,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn common_name(&self) -> Result<&str, Error> {
        self.common_name
            .as_deref()
            .ok_or_else(|| Error::CsrMissingCnEntry {
                subject: self.subject.clone(),
                spiffe_id: self.uri_sans.join(","),
            })
    }

    pub fn set_common_name(&mut self, common_name: String) {
        self.common_name = Some(common_name);
    }

    /// Extracts the single URI subjectAltName carried in the request extensions.
    pub fn spiffe_id(&self) -> Result<SpiffeId, Error> {
        match self.uri_sans.as_slice() {
            [] => Err(Error::CsrMissingSpiffeId),
            [uri] => uri.parse(),
            _ => Err(Error::CsrVerification(
                "CSR must contain exactly one URI SAN".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use crate::test_helpers;

    const SPIFFE: &str = "spiffe://cluster.local/namespace/app-ns/pod/app-0";

    #[test]
    fn parse_csr() {
        let pem = test_helpers::ca::csr_pem(Some("app-ns.service_account.app-sa"), &[SPIFFE]);
        let csr = SmartCsr::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(csr.common_name().unwrap(), "app-ns.service_account.app-sa");
        let id = csr.spiffe_id().unwrap();
        assert_eq!(id.namespace(), "app-ns");
        assert_eq!(id.name(), "app-0");
        assert!(csr.subject().contains("app-ns.service_account.app-sa"));
    }

    #[test]
    fn set_common_name() {
        let pem = test_helpers::ca::csr_pem(Some("ns.pod.p"), &[SPIFFE]);
        let mut csr = SmartCsr::from_pem(pem.as_bytes()).unwrap();
        csr.set_common_name("host.conjur.authn-k8s.svc.apps.ns.pod.p".to_string());
        assert_eq!(
            csr.common_name().unwrap(),
            "host.conjur.authn-k8s.svc.apps.ns.pod.p"
        );
    }

    #[test]
    fn missing_spiffe_id() {
        let pem = test_helpers::ca::csr_pem(Some("ns.pod.p"), &[]);
        let csr = SmartCsr::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(csr.spiffe_id(), Err(Error::CsrMissingSpiffeId));
    }

    #[test]
    fn multiple_uri_sans() {
        let pem = test_helpers::ca::csr_pem(
            Some("ns.pod.p"),
            &[SPIFFE, "spiffe://cluster.local/namespace/x/pod/y"],
        );
        let csr = SmartCsr::from_pem(pem.as_bytes()).unwrap();
        assert_matches!(csr.spiffe_id(), Err(Error::CsrVerification(_)));
    }

    #[test]
    fn missing_common_name() {
        let pem = test_helpers::ca::csr_pem(None, &[SPIFFE]);
        let csr = SmartCsr::from_pem(pem.as_bytes()).unwrap();
        let err = csr.common_name().unwrap_err();
        assert_matches!(err, Error::CsrMissingCnEntry { .. });
        assert_eq!(err.code(), Some("CONJ00058E"));
    }

    #[test]
    fn not_a_csr() {
        let err = SmartCsr::from_pem(b"hello").unwrap_err();
        assert_matches!(err, Error::CsrParse(_));
    }
}
