//! Cache keys and eligibility.

use super::CachePolicy;
use crate::request::{RequestBody, RequestConfig};
use http::Method;
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Headers that never take part in the default key.
const VOLATILE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "user-agent",
    "x-request-id",
    "x-correlation-id",
    "x-retry-attempt",
    "date",
    "content-length",
];

#[derive(Serialize)]
struct KeyParts<'a> {
    method: &'a str,
    url: &'a str,
    params: BTreeMap<String, Vec<String>>,
    headers: BTreeMap<&'a str, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

/// Key under which a response to `config` is stored.
///
/// A custom `key_generator` on the policy replaces the default entirely.
#[must_use]
pub fn generate_key(config: &RequestConfig, policy: &CachePolicy) -> String {
    if let Some(generator) = &policy.key_generator {
        return generator(config);
    }
    default_key(config, policy.include_body_in_key)
}

/// Stable key from method, URL, sorted query and non-volatile headers.
///
/// Query parameters written into the URL and passed through `params` are
/// merged, so both spellings of the same request share a key.
#[must_use]
pub fn default_key(config: &RequestConfig, include_body: bool) -> String {
    let full = config.full_url().unwrap_or_default();
    let without_fragment = full.split('#').next().unwrap_or_default();
    let (base, query) = without_fragment
        .split_once('?')
        .unwrap_or((without_fragment, ""));

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        if !config.params.contains(&name) {
            params
                .entry(name.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }
    for (name, values) in config.params.iter() {
        params.insert(name.to_owned(), values.to_vec());
    }
    for values in params.values_mut() {
        values.sort();
    }

    let mut headers: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in &config.headers {
        if VOLATILE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers
            .entry(name.as_str())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let method = config.method();
    let parts = KeyParts {
        method: method.as_str(),
        url: base,
        params,
        headers,
        body: if include_body {
            body_digest(config.data.as_ref())
        } else {
            None
        },
    };
    serde_json::to_string(&parts).unwrap_or_else(|_| format!("{method} {full}"))
}

fn body_digest(body: Option<&RequestBody>) -> Option<String> {
    let bytes: Vec<u8> = match body? {
        RequestBody::Text(text) | RequestBody::Form(text) => text.as_bytes().to_vec(),
        RequestBody::Binary(bytes) => bytes.to_vec(),
        RequestBody::Json(value) => value.to_string().into_bytes(),
        RequestBody::Stream(_) => return None,
    };
    Some(hex::encode(Sha256::digest(&bytes)))
}

/// Safe, credential-free requests only.
#[must_use]
pub fn is_cacheable(config: &RequestConfig) -> bool {
    let method = config.method();
    let safe = method == Method::GET || method == Method::HEAD || method == Method::OPTIONS;
    safe && config.auth.is_none()
        && !config.headers.contains_key(AUTHORIZATION)
        && !config.headers.contains_key(PROXY_AUTHORIZATION)
}
