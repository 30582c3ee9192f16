use crate::config::{AuthConfig, Env};
use crate::error::{AppError, ErrorKind};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Compiles an origin's `domain_pattern` (a literal host or a `*.`
/// wildcard) into a regex anchored on the full host (spec.md §3
/// "Origin"). Returns a human-readable error, not a `regex::Error`,
/// since this is surfaced through `ConfigError::InvalidPattern`.
pub fn compile_domain_pattern(pattern: &str) -> Result<Regex, String> {
    if pattern.trim().is_empty() {
        return Err("empty pattern".into());
    }
    let escaped = if let Some(rest) = pattern.strip_prefix("*.") {
        format!("^([a-zA-Z0-9-]+\\.)*{}$", regex::escape(rest))
    } else {
        format!("^{}$", regex::escape(pattern))
    };
    Regex::new(&escaped).map_err(|e| e.to_string())
}

pub fn matches_domain(pattern: &Regex, host: &str) -> bool {
    pattern.is_match(host)
}

/// Applies the origin's `AuthConfig` to an outgoing request, returning
/// the extra headers to send and/or a rewritten URL (spec.md §4.2.2).
pub struct AuthDecision {
    pub headers: Vec<(String, String)>,
    pub url: String,
}

pub fn apply_auth(auth: &AuthConfig, url: &str, env: &Env) -> Result<AuthDecision, AppError> {
    match auth {
        AuthConfig::None => Ok(AuthDecision { headers: vec![], url: url.to_string() }),
        AuthConfig::Bearer { secret_ref } => {
            let secret = env
                .get(secret_ref)
                .ok_or_else(|| AppError::new(ErrorKind::AuthFailure, format!("missing secret `{secret_ref}`")))?;
            let token = bearer_token(url, secret)?;
            Ok(AuthDecision {
                headers: vec![("authorization".to_string(), format!("Bearer {token}"))],
                url: url.to_string(),
            })
        }
        AuthConfig::CustomHeader { headers } => Ok(AuthDecision {
            headers: headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            url: url.to_string(),
        }),
        AuthConfig::SignedQuery { secret_ref, token_param, expiry_window_secs } => {
            let secret = env
                .get(secret_ref)
                .ok_or_else(|| AppError::new(ErrorKind::AuthFailure, format!("missing secret `{secret_ref}`")))?;
            let expires = now_secs() + (*expiry_window_secs).max(0) as u64;
            let signed = sign_query(url, token_param, secret, expires)?;
            Ok(AuthDecision { headers: vec![], url: signed })
        }
        AuthConfig::S3Sig { access_key_ref, secret_key_ref, region, service } => {
            let access_key = env
                .get(access_key_ref)
                .ok_or_else(|| AppError::new(ErrorKind::AuthFailure, format!("missing secret `{access_key_ref}`")))?;
            let secret_key = env
                .get(secret_key_ref)
                .ok_or_else(|| AppError::new(ErrorKind::AuthFailure, format!("missing secret `{secret_key_ref}`")))?;
            let headers = sigv4_headers(url, access_key, secret_key, region, service)?;
            Ok(AuthDecision { headers, url: url.to_string() })
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// `spec.md` §9 flags the source's bearer scheme (`base64(domain:ts:secret)`)
/// as an illustrative placeholder and calls for HMAC-SHA256 over a canonical
/// string instead. Token is `<ts>.<hex hmac>` over `domain:ts`, keyed by the
/// origin secret, so a verifying origin can recompute it without us minting
/// an opaque blob it has no way to check.
fn bearer_token(url: &str, secret: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(url).map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    let domain = parsed.host_str().ok_or_else(|| AppError::new(ErrorKind::AuthFailure, "url has no host"))?;
    let ts = now_secs();
    let canonical = format!("{domain}:{ts}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    mac.update(canonical.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{ts}.{sig}"))
}

/// Appends an HMAC-SHA256 signature and expiry to a URL's query string,
/// using a canonical sorted-query-string scheme with an arbitrary token
/// parameter name.
fn sign_query(url: &str, token_param: &str, secret: &str, expires: u64) -> Result<String, AppError> {
    let mut parsed = url::Url::parse(url).map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    parsed.query_pairs_mut().append_pair("expires", &expires.to_string());

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pairs.sort();
    let canonical = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    mac.update(canonical.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    parsed.query_pairs_mut().append_pair(token_param, &signature);
    Ok(parsed.to_string())
}

/// Verifies a signed-query URL the same way it was produced, used when
/// this crate itself is the signer on the `/sign` endpoint path.
pub fn verify_signed_query(url: &str, token_param: &str, secret: &str) -> Result<(), AppError> {
    let parsed = url::Url::parse(url).map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != token_param)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pairs.sort();

    let provided = parsed
        .query_pairs()
        .find(|(k, _)| k == token_param)
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| AppError::new(ErrorKind::AuthFailure, "missing signature token"))?;

    let expires: Option<u64> = pairs
        .iter()
        .find(|(k, _)| k == "expires")
        .and_then(|(_, v)| v.parse().ok());
    if let Some(expires) = expires {
        if now_secs() > expires {
            return Err(AppError::new(ErrorKind::AuthFailure, "signature expired"));
        }
    }

    let canonical = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    mac.update(canonical.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected != provided {
        return Err(AppError::new(ErrorKind::AuthFailure, "signature mismatch"));
    }
    Ok(())
}

/// Hand-rolled AWS SigV4 for GET requests (spec.md §4.2.2 "s3-sig"),
/// since no example in the pack calls the `aws-sigv4` crate directly.
/// Builds the canonical request, string-to-sign, derives the signing
/// key, and returns the `Authorization` + `x-amz-date` headers.
fn sigv4_headers(url: &str, access_key: &str, secret_key: &str, region: &str, service: &str) -> Result<Vec<(String, String)>, AppError> {
    let parsed = url::Url::parse(url).map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| AppError::new(ErrorKind::AuthFailure, "url has no host"))?.to_string();
    let path = if parsed.path().is_empty() { "/".to_string() } else { parsed.path().to_string() };

    let mut query_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    query_pairs.sort();
    let canonical_query = query_pairs
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let now = time::OffsetDateTime::now_utc();
    let amz_date = format_amz_date(now);
    let date_stamp = format_date_stamp(now);

    let canonical_headers = format!("host:{host}\nx-amz-date:{amz_date}\n");
    let signed_headers = "host;x-amz-date";
    let payload_hash = hex::encode(Sha256::digest(b""));

    let canonical_request = format!(
        "GET\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let credential_scope = format!("{date_stamp}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_signing_key(secret_key, &date_stamp, region, service)?;
    let mut mac = HmacSha256::new_from_slice(&signing_key).map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}"
    );

    Ok(vec![
        ("authorization".to_string(), authorization),
        ("x-amz-date".to_string(), amz_date),
    ])
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>, AppError> {
    fn hmac_bytes(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AppError> {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|e| AppError::new(ErrorKind::AuthFailure, e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
    let k_date = hmac_bytes(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_bytes(&k_date, region.as_bytes())?;
    let k_service = hmac_bytes(&k_region, service.as_bytes())?;
    hmac_bytes(&k_service, b"aws4_request")
}

fn uri_encode(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn format_amz_date(t: time::OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

fn format_date_stamp(t: time::OffsetDateTime) -> String {
    format!("{:04}{:02}{:02}", t.year(), u8::from(t.month()), t.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_pattern_matches_subdomains_not_bare_domain() {
        let re = compile_domain_pattern("*.example.com").unwrap();
        assert!(matches_domain(&re, "img.example.com"));
        assert!(matches_domain(&re, "a.b.example.com"));
        assert!(!matches_domain(&re, "notexample.com"));
    }

    #[test]
    fn literal_pattern_matches_exact_host_only() {
        let re = compile_domain_pattern("img.example.com").unwrap();
        assert!(matches_domain(&re, "img.example.com"));
        assert!(!matches_domain(&re, "other.example.com"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(compile_domain_pattern("").is_err());
    }

    #[test]
    fn bearer_auth_requires_secret_present() {
        let env = Env::default();
        let auth = AuthConfig::Bearer { secret_ref: "AUTH_TOKEN_SECRET_X".into() };
        let result = apply_auth(&auth, "https://img.example.com/a.jpg", &env);
        assert!(result.is_err());
    }

    #[test]
    fn bearer_auth_sets_an_hmac_derived_authorization_header() {
        let env = Env::default().with("AUTH_TOKEN_SECRET_X", "s3cr3t");
        let auth = AuthConfig::Bearer { secret_ref: "AUTH_TOKEN_SECRET_X".into() };
        let decision = apply_auth(&auth, "https://img.example.com/a.jpg", &env).unwrap();
        assert_eq!(decision.headers.len(), 1);
        let (name, value) = &decision.headers[0];
        assert_eq!(name, "authorization");
        let token = value.strip_prefix("Bearer ").expect("bearer prefix");
        let (ts, sig) = token.split_once('.').expect("ts.sig shape");
        assert!(ts.parse::<u64>().is_ok());
        assert_eq!(sig.len(), 64);
        // never the raw secret itself
        assert!(!value.contains("s3cr3t"));
    }

    #[test]
    fn bearer_auth_tokens_differ_across_domains() {
        let env = Env::default().with("AUTH_TOKEN_SECRET_X", "s3cr3t");
        let auth = AuthConfig::Bearer { secret_ref: "AUTH_TOKEN_SECRET_X".into() };
        let a = apply_auth(&auth, "https://img.example.com/a.jpg", &env).unwrap();
        let b = apply_auth(&auth, "https://other.example.com/a.jpg", &env).unwrap();
        assert_ne!(a.headers[0].1, b.headers[0].1);
    }

    #[test]
    fn signed_query_round_trips_through_verify() {
        let env = Env::default().with("AUTH_SIGNING_SECRET_X", "s3cr3t");
        let auth = AuthConfig::SignedQuery {
            secret_ref: "AUTH_SIGNING_SECRET_X".into(),
            token_param: "sig".into(),
            expiry_window_secs: 300,
        };
        let decision = apply_auth(&auth, "https://img.example.com/a.jpg?w=400", &env).unwrap();
        assert!(verify_signed_query(&decision.url, "sig", "s3cr3t").is_ok());
    }

    #[test]
    fn signed_query_rejects_tampered_url() {
        let env = Env::default().with("AUTH_SIGNING_SECRET_X", "s3cr3t");
        let auth = AuthConfig::SignedQuery {
            secret_ref: "AUTH_SIGNING_SECRET_X".into(),
            token_param: "sig".into(),
            expiry_window_secs: 300,
        };
        let decision = apply_auth(&auth, "https://img.example.com/a.jpg?w=400", &env).unwrap();
        let tampered = decision.url.replace("w=400", "w=9999");
        assert!(verify_signed_query(&tampered, "sig", "s3cr3t").is_err());
    }

    #[test]
    fn s3_sig_produces_authorization_and_date_headers() {
        let env = Env::default()
            .with("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE")
            .with("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMI");
        let auth = AuthConfig::S3Sig {
            access_key_ref: "AWS_ACCESS_KEY_ID".into(),
            secret_key_ref: "AWS_SECRET_ACCESS_KEY".into(),
            region: "us-east-1".into(),
            service: "s3".into(),
        };
        let decision = apply_auth(&auth, "https://bucket.s3.amazonaws.com/key.jpg", &env).unwrap();
        assert!(decision.headers.iter().any(|(k, _)| k == "authorization"));
        assert!(decision.headers.iter().any(|(k, _)| k == "x-amz-date"));
    }

    #[test]
    fn none_auth_passes_url_through_unchanged() {
        let env = Env::default();
        let decision = apply_auth(&AuthConfig::None, "https://img.example.com/a.jpg", &env).unwrap();
        assert_eq!(decision.url, "https://img.example.com/a.jpg");
        assert!(decision.headers.is_empty());
    }
}
