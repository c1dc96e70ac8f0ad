//! `WEB_SEARCH` and `WEB_FETCH` tools, gated behind the `web-tools` feature.
//! Both enforce the egress policy (TLS, private-IP block, redirect limit,
//! payload cap) and scan fetched content for injected instructions.

use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use super::egress::{check_payload_size, check_resolved_ip, check_url, scan_for_injection, EgressPolicy};
use super::Tool;
use crate::types::error::ToolError;

/// `WEB_SEARCH`: queries a configured search endpoint and returns a list of
/// `{title, url, snippet}` results. Backed by any HTTP search API that
/// returns JSON; the endpoint URL is itself subject to the egress policy.
pub struct WebSearchTool {
    pub client: reqwest::Client,
    pub endpoint: Url,
    pub policy: EgressPolicy,
}

impl WebSearchTool {
    pub fn new(endpoint: Url, policy: EgressPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            policy,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "WEB_SEARCH"
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        check_url(&self.endpoint, &self.policy)?;
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ParseError("missing 'query' argument".into()))?;

        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::Network(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ToolError::Network(e.to_string()))?;
        check_payload_size(body.len(), &self.policy)?;

        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| ToolError::ParseError(e.to_string()))?;
        Ok(parsed)
    }
}

/// `WEB_FETCH`: retrieves a single URL's content, rejecting blocked schemes,
/// private hosts, oversized bodies, and content carrying injection markers.
pub struct WebFetchTool {
    pub client: reqwest::Client,
    pub policy: EgressPolicy,
}

impl WebFetchTool {
    pub fn new(policy: EgressPolicy) -> Self {
        let redirect_policy = build_redirect_policy(policy.clone());
        Self {
            client: reqwest::Client::builder().redirect(redirect_policy).build().unwrap_or_default(),
            policy,
        }
    }
}

/// Every redirect hop gets the same scrutiny as the original URL: TLS, the
/// literal-IP private-address check, and the redirect-count ceiling. Host
/// names are only checked when the hop's URL carries a literal IP; DNS-based
/// private-IP evasion on a redirect target is caught by the resolver, not
/// here.
fn build_redirect_policy(policy: EgressPolicy) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > policy.max_redirects as usize {
            return attempt.error(ToolError::RedirectLimit);
        }
        if policy.require_tls && attempt.url().scheme() != "https" {
            return attempt.error(ToolError::TlsRequired);
        }
        if policy.block_private_ips {
            if let Some(host) = attempt.url().host_str() {
                if let Ok(ip) = host.parse::<IpAddr>() {
                    if let Err(e) = check_resolved_ip(ip, &policy) {
                        return attempt.error(e);
                    }
                }
            }
        }
        attempt.follow()
    })
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &'static str {
        "WEB_FETCH"
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let raw_url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::ParseError("missing 'url' argument".into()))?;
        let url = Url::parse(raw_url).map_err(|e| ToolError::ParseError(e.to_string()))?;
        check_url(&url, &self.policy)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolError::Network(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ToolError::Network(e.to_string()))?;
        check_payload_size(body.len(), &self.policy)?;

        let text = String::from_utf8_lossy(&body).to_string();
        if scan_for_injection(&text) {
            return Err(ToolError::InjectionBlocked);
        }

        Ok(json!({ "url": url.as_str(), "content": text }))
    }
}
