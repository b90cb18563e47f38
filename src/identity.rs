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

mod csr;
pub use csr::*;

mod host;
pub use host::*;

mod spiffe;
pub use spiffe::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CONJ00022E CSR must contain SPIFFE ID SAN")]
    CsrMissingSpiffeId,
    #[error(
        "CONJ00058E CSR [subject: '{subject}', spiffe_id: '{spiffe_id}'] must have a CN (common name) entry."
    )]
    CsrMissingCnEntry { subject: String, spiffe_id: String },
    #[error("failed to parse CSR: {0}")]
    CsrParse(String),
    #[error("CSR verification failed: {0}")]
    CsrVerification(String),
    #[error("invalid spiffe identity: {0}")]
    Spiffe(String),
}

impl Error {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::CsrMissingSpiffeId => Some("CONJ00022E"),
            Error::CsrMissingCnEntry { .. } => Some("CONJ00058E"),
            _ => None,
        }
    }
}
