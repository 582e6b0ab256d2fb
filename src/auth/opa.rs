// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Open Policy Agent decision client.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// The document POSTed to the policy endpoint as `{"input": ...}`.
#[derive(Debug, Serialize)]
pub struct PolicyInput {
    /// PEM of the client certificate, when one was presented.
    pub cert: Option<String>,
    pub fingerprint: Option<String>,
    pub path: String,
    pub method: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PolicyDecision {
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub roles: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct PolicyResponse {
    /// OPA's data API nests the decision under `result`; a bare decision
    /// document is accepted as well.
    result: Option<PolicyDecision>,
    #[serde(default)]
    allow: Option<bool>,
    #[serde(default)]
    roles: Option<HashSet<String>>,
}

pub struct PolicyClient {
    url: String,
    client: reqwest::Client,
}

impl PolicyClient {
    pub fn new(url: String, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }

    #[tracing::instrument(skip_all, fields(path = input.path, method = input.method))]
    pub async fn check(&self, input: &PolicyInput) -> anyhow::Result<PolicyDecision> {
        let body = serde_json::json!({ "input": input });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: PolicyResponse = response.json().await?;
        if let Some(decision) = parsed.result {
            return Ok(decision);
        }
        Ok(PolicyDecision {
            allow: parsed.allow.unwrap_or(false),
            roles: parsed.roles.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_and_bare_decisions_parse() {
        let nested: PolicyResponse =
            serde_json::from_str(r#"{"result": {"allow": true, "roles": ["signers"]}}"#).unwrap();
        let decision = nested.result.unwrap();
        assert!(decision.allow);
        assert!(decision.roles.contains("signers"));

        let bare: PolicyResponse =
            serde_json::from_str(r#"{"allow": false, "roles": []}"#).unwrap();
        assert!(bare.result.is_none());
        assert_eq!(bare.allow, Some(false));
    }
}
