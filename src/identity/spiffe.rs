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

use std::fmt;
use std::str::FromStr;

use url::Url;

use super::Error;

/// A pod identity of the form `spiffe://<trust-domain>/namespace/<ns>/pod/<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: String,
    namespace: String,
    name: String,
}

impl SpiffeId {
    pub fn new(trust_domain: &str, namespace: &str, name: &str) -> Self {
        SpiffeId {
            trust_domain: trust_domain.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The pod name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renders the identity as an X.509 subjectAltName entry.
    pub fn to_altname(&self) -> String {
        format!("URI:{self}")
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "spiffe://{}/namespace/{}/pod/{}",
            self.trust_domain, self.namespace, self.name
        )
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| Error::Spiffe(format!("{s}: {e}")))?;
        if url.scheme() != "spiffe" {
            return Err(Error::Spiffe(format!("{s}: scheme must be spiffe")));
        }
        let trust_domain = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Spiffe(format!("{s}: missing trust domain")))?;
        // Positional: the segment keywords are not significant.
        let segments: Vec<&str> = url.path().trim_start_matches('/').split('/').collect();
        let [_, namespace, _, name] = segments.as_slice() else {
            return Err(Error::Spiffe(format!(
                "{s}: path must be /namespace/<namespace>/pod/<name>"
            )));
        };
        if namespace.is_empty() || name.is_empty() {
            return Err(Error::Spiffe(format!("{s}: empty namespace or pod name")));
        }
        Ok(SpiffeId::new(trust_domain, namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse() {
        let id: SpiffeId = "spiffe://cluster.local/namespace/app-ns/pod/app-7f9c"
            .parse()
            .unwrap();
        assert_eq!(id.trust_domain(), "cluster.local");
        assert_eq!(id.namespace(), "app-ns");
        assert_eq!(id.name(), "app-7f9c");
        assert_eq!(
            id.to_altname(),
            "URI:spiffe://cluster.local/namespace/app-ns/pod/app-7f9c"
        );
    }

    #[test]
    fn alternate_keywords() {
        let id: SpiffeId = "spiffe://cluster.local/namespace/ns/podname/p1"
            .parse()
            .unwrap();
        assert_eq!(id.namespace(), "ns");
        assert_eq!(id.name(), "p1");
    }

    #[test_case("https://cluster.local/namespace/ns/pod/p1"; "wrong scheme")]
    #[test_case("spiffe://cluster.local/namespace/ns"; "too short")]
    #[test_case("spiffe://cluster.local/namespace/ns/pod/p1/extra"; "too long")]
    #[test_case("spiffe://cluster.local/namespace//pod/p1"; "empty namespace")]
    #[test_case("not a uri"; "garbage")]
    fn invalid(input: &str) {
        assert!(matches!(input.parse::<SpiffeId>(), Err(Error::Spiffe(_))));
    }
}
