//! ACS3-HMAC-SHA256 request signing for the metadata endpoint.
//!
//! Signing is a pure function of the request: it returns the headers to
//! merge instead of mutating shared state, so a request replayed with the
//! returned timestamp, nonce and content hash reproduces the signature
//! byte-for-byte.
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub const SIGNATURE_ALGORITHM: &str = "ACS3-HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

/// Sign a request and return the signing headers to merge into it:
/// `x-content-sha256`, `x-auth-timestamp`, `x-auth-nonce` and
/// `Authorization`.
///
/// Timestamp and nonce already present in `headers` are reused, which makes
/// the signature reproducible.
pub fn sign_request(
    method: &str,
    uri_path: &str,
    query_string: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
    source_token: &str,
    project_secret: &str,
) -> HashMap<String, String> {
    // Canonicalization works on lowercase header names; BTreeMap keeps them
    // sorted for the SignedHeaders list.
    let mut sign_headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();

    let hashed_payload = sha256_hex(body);
    sign_headers.insert("x-content-sha256".to_owned(), hashed_payload.clone());
    sign_headers
        .entry("x-auth-timestamp".to_owned())
        .or_insert_with(|| Utc::now().timestamp_millis().to_string());
    sign_headers
        .entry("x-auth-nonce".to_owned())
        .or_insert_with(generate_nonce);

    let canonical_request =
        build_canonical_request(method, uri_path, query_string, &sign_headers, &hashed_payload);
    let string_to_sign = format!(
        "{SIGNATURE_ALGORITHM}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let signature = hmac_sha256_hex(project_secret, &string_to_sign);

    let signed_headers = sorted_header_keys(&sign_headers);
    let authorization = format!(
        "{SIGNATURE_ALGORITHM} Credential={source_token},SignedHeaders={signed_headers},Signature={signature}"
    );

    HashMap::from([
        (
            "x-content-sha256".to_owned(),
            sign_headers["x-content-sha256"].clone(),
        ),
        (
            "x-auth-timestamp".to_owned(),
            sign_headers["x-auth-timestamp"].clone(),
        ),
        (
            "x-auth-nonce".to_owned(),
            sign_headers["x-auth-nonce"].clone(),
        ),
        ("Authorization".to_owned(), authorization),
    ])
}

fn build_canonical_request(
    method: &str,
    uri_path: &str,
    query_string: &str,
    headers: &BTreeMap<String, String>,
    hashed_payload: &str,
) -> String {
    let mut out = String::new();
    out.push_str(method);
    out.push('\n');
    out.push_str(uri_path);
    out.push('\n');
    out.push_str(query_string);
    out.push('\n');

    // CanonicalHeaders: sorted "name:value" lines
    for (name, value) in headers {
        out.push_str(name);
        out.push(':');
        out.push_str(value.trim());
        out.push('\n');
    }
    out.push('\n');

    // SignedHeaders
    out.push_str(&sorted_header_keys(headers));
    out.push('\n');

    // HashedPayload
    out.push_str(hashed_payload);

    out
}

fn sorted_header_keys(headers: &BTreeMap<String, String>) -> String {
    headers.keys().cloned().collect::<Vec<_>>().join(";")
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256_hex(key: &str, data: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts keys of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn generate_nonce() -> String {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}
