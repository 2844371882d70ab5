//! The `fetch` module's HTTP client.
//!
//! - Only origins in the policy are reachable (`*` allows any)
//! - Redirects are followed by hand and only within the starting origin
//! - Every request is bounded by what is left of the run's deadline

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use url::Url;

use super::allowlist::Capability;
use super::ops::{granted, Deadline};

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct FetchPolicy {
    /// Allowed origins (scheme + host + port), or `*` for any.
    pub allowed_origins: Vec<String>,
}

impl FetchPolicy {
    pub fn from_list(list: &str) -> Self {
        Self {
            allowed_origins: list
                .split(',')
                .map(|s| s.trim().trim_end_matches('/'))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || origin == *allowed)
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, AnyError> {
    let (policy, remaining) = {
        let state = state.borrow();
        let capabilities = granted(&state, Capability::Fetch)?;
        (capabilities.fetch.clone(), state.borrow::<Deadline>().remaining())
    };

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(remaining.max(Duration::from_millis(1)))
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {e}"))?;

    do_fetch(&client, &policy, request, 0).await
}

async fn do_fetch(
    client: &Client,
    policy: &FetchPolicy,
    request: FetchRequest,
    hops: usize,
) -> Result<FetchResponse, AnyError> {
    let url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {e}", request.url))?;

    if !policy.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist",
            url.origin().ascii_serialization()
        ));
    }

    let method = match request.method.as_deref().unwrap_or("GET").to_uppercase().as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "PATCH" => Method::PATCH,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        other => return Err(anyhow!("Unsupported HTTP method: {other}")),
    };

    let mut builder = client.request(method, url.clone());
    if let Some(headers) = &request.headers {
        for (key, value) in headers {
            builder = builder.header(key, value);
        }
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| anyhow!("Fetch failed: {e}"))?;

    let status = response.status();
    let final_url = response.url().clone();

    if status.is_redirection() {
        if let Some(location) = response.headers().get("location") {
            if hops >= MAX_REDIRECTS {
                return Err(anyhow!("Fetch blocked: too many redirects"));
            }
            let location = location
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let redirect_url = final_url
                .join(location)
                .map_err(|e| anyhow!("Invalid redirect URL: {e}"))?;

            if redirect_url.origin() != url.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    redirect_url.origin().ascii_serialization(),
                    url.origin().ascii_serialization()
                ));
            }

            let redirect = FetchRequest {
                url: redirect_url.to_string(),
                method: Some("GET".to_string()),
                headers: request.headers,
                body: None,
            };
            return Box::pin(do_fetch(client, policy, redirect, hops + 1)).await;
        }
    }

    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {e}"))?;

    Ok(FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers,
        url: final_url.to_string(),
        body,
    })
}
