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

use tracing::{debug, instrument};

use super::{Error, K8sObjectLookup, Kind};

/// Validates pod namespaces against namespace label selectors.
pub struct K8sResourceValidator<'a> {
    lookup: &'a dyn K8sObjectLookup,
    namespace: String,
}

impl<'a> K8sResourceValidator<'a> {
    pub fn new(lookup: &'a dyn K8sObjectLookup, namespace: impl Into<String>) -> Self {
        K8sResourceValidator {
            lookup,
            namespace: namespace.into(),
        }
    }

    /// Succeeds when the namespace's live labels satisfy every `key=value` pair in
    /// `label_selector`.
    #[instrument(skip(self), fields(namespace = self.namespace))]
    pub async fn valid_namespace(&self, label_selector: &str) -> Result<bool, Error> {
        let selector = parse_label_selector(label_selector)?;
        let labels = self
            .lookup
            .namespace_labels_hash(&self.namespace)
            .await?
            .ok_or_else(|| {
                Error::ResourceNotFound(
                    Kind::Namespace.to_string(),
                    self.namespace.clone(),
                    self.namespace.clone(),
                )
            })?;
        if !matches_labels(&selector, &labels) {
            debug!(?labels, "namespace labels do not satisfy selector");
            return Err(Error::LabelSelectorMismatch(
                label_selector.to_string(),
                self.namespace.clone(),
            ));
        }
        Ok(true)
    }
}

/// Parses a comma-separated list of equality requirements. Only `=` and `==` are supported.
pub fn parse_label_selector(selector: &str) -> Result<Vec<(String, String)>, Error> {
    let invalid = |reason: &str| Error::InvalidLabelSelector(selector.to_string(), reason.to_string());
    if selector.trim().is_empty() {
        return Err(invalid("selector is empty"));
    }
    selector
        .split(',')
        .map(|requirement| {
            if requirement.contains("!=") {
                return Err(invalid("only '=' and '==' operators are supported"));
            }
            let (key, value) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
                .ok_or_else(|| invalid("expected key=value pairs"))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.contains('=') {
                return Err(invalid("expected key=value pairs"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn matches_labels(selector: &[(String, String)], labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
