//! AWS Signature Version 4.
//!
//! The algorithm consists of four steps:
//!
//! 1. Create a canonical request
//! 2. Create the string to sign
//! 3. Calculate the signing key
//! 4. Add the signature to the request
//!
//! Reference: <https://docs.aws.amazon.com/general/latest/gr/sigv4_signing.html>

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// The hashing algorithm used by SigV4.
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Hash of an empty payload.
pub const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Everything except the RFC 3986 unreserved set is percent-encoded.
const SIGV4_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// SigV4 signer bound to one credential scope.
#[derive(Clone)]
pub struct SigV4Signer {
    pub access_key_id: String,
    secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
    pub service: String,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

impl SigV4Signer {
    pub fn new(
        access_key_id: &str,
        secret_access_key: &str,
        session_token: Option<&str>,
        region: &str,
        service: &str,
    ) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: session_token.map(|s| s.to_string()),
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    /// Sign a request and return the full header set including
    /// `authorization`.
    ///
    /// `headers` must already contain `host`.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        timestamp: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let mut signed_headers: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        signed_headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(ref token) = self.session_token {
            signed_headers.insert("x-amz-security-token".to_string(), token.clone());
        }
        let payload_hash = sha256_hex(body);
        signed_headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());

        let (canonical_uri, canonical_querystring) = parse_url_components(url);

        // Step 1
        let canonical_request = self.create_canonical_request(
            method,
            &canonical_uri,
            &canonical_querystring,
            &signed_headers,
            &payload_hash,
        );

        // Step 2
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        // Step 3
        let signing_key = self.derive_signing_key(&date_stamp);

        // Step 4
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key_id,
            credential_scope,
            signed_header_names(&signed_headers),
            signature
        );
        signed_headers.insert("authorization".to_string(), authorization);
        signed_headers
    }

    /// CanonicalRequest =
    ///   Method \n CanonicalURI \n CanonicalQueryString \n
    ///   CanonicalHeaders \n SignedHeaders \n HexEncode(Hash(Payload))
    fn create_canonical_request(
        &self,
        method: &str,
        canonical_uri: &str,
        canonical_querystring: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
    ) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri,
            canonical_querystring,
            canonical_headers(headers),
            signed_header_names(headers),
            payload_hash
        )
    }

    /// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
    fn derive_signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

// ── Helper functions ────────────────────────────────────────────────────

/// Headers lowercased, sorted and whitespace-trimmed, one per line.
fn canonical_headers(headers: &BTreeMap<String, String>) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect()
}

fn signed_header_names(headers: &BTreeMap<String, String>) -> String {
    headers.keys().cloned().collect::<Vec<_>>().join(";")
}

/// SHA-256 hex digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC accepts keys of any length.
        Err(_) => Vec::new(),
    }
}

/// Split a URL into (canonical_uri, canonical_querystring).
fn parse_url_components(url: &str) -> (String, String) {
    let Ok(parsed) = url::Url::parse(url) else {
        return ("/".to_string(), String::new());
    };
    let path = if parsed.path().is_empty() {
        "/".to_string()
    } else {
        // The URL keeps the path percent-encoded already; decode first so
        // each segment is encoded exactly once.
        let decoded = percent_encoding::percent_decode_str(parsed.path()).decode_utf8_lossy();
        uri_encode_path(&decoded)
    };

    let mut query_params: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    query_params.sort();
    let query_string = query_params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<String>>()
        .join("&");

    (path, query_string)
}

/// URI-encode a string per RFC 3986 (everything but unreserved characters).
pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, SIGV4_ENCODE_SET).to_string()
}

/// URI-encode a URL path, preserving forward slashes.
pub fn uri_encode_path(path: &str) -> String {
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<String>>()
        .join("/")
}

/// Build a query string from parameters sorted alphabetically.
pub fn build_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<String>>()
        .join("&")
}
