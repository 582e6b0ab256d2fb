// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! HTTP endpoints: health, key directory, and the signing pipeline.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use openssl::x509::{X509, X509Ref};
use serde::Serialize;
use tracing::instrument;

use crate::auth::{self, Principal};
use crate::error::SignError;
use crate::protocol::{DigestAlgorithm, SignatureFormat};
use crate::server::service::{AppState, Peer};
use crate::sign::{self, SignContext, SignOptions};

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("Content-Type", "text/plain; charset=utf-8".parse().unwrap());
    response
}

fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert("Content-Type", "application/json".parse().unwrap());
    response
}

fn error_response(state: &AppState, error: &SignError) -> Response<Full<Bytes>> {
    let mut response = text_response(error.status(), error.to_string());
    if matches!(error, SignError::TokenUnavailable(_)) {
        response
            .headers_mut()
            .insert("Retry-After", "10".parse().unwrap());
    }
    if matches!(error, SignError::Unauthorized)
        && let Some(challenge) = state.auth.challenge()
        && let Ok(value) = challenge.parse()
    {
        response.headers_mut().insert("WWW-Authenticate", value);
    }
    response
}

/// Minimal percent-decoding for query values and proxied PEM headers.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(name), percent_decode(value));
    }
    params
}

fn truthy(value: Option<&String>) -> bool {
    matches!(
        value.map(|v| v.as_str()),
        Some("1") | Some("true") | Some("yes")
    )
}

/// The client certificate for a request: from the TLS session, or from
/// `Ssl-Client-Certificate` when a trusted proxy forwarded it.
fn request_certificate(
    state: &AppState,
    peer: &Peer,
    req: &Request<Incoming>,
) -> Option<Arc<X509>> {
    if let Some(certificate) = &peer.certificate {
        return Some(certificate.clone());
    }
    if !state.auth.is_trusted_proxy(&peer.addr.ip()) {
        return None;
    }
    let header = req.headers().get("Ssl-Client-Certificate")?;
    let pem = percent_decode(header.to_str().ok()?);
    X509::from_pem(pem.as_bytes()).ok().map(Arc::new)
}

#[derive(Serialize)]
struct PoolHealth {
    healthy: bool,
    workers: usize,
    healthy_workers: usize,
    disabled: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    tokens: HashMap<String, PoolHealth>,
}

fn health(state: &AppState) -> Response<Full<Bytes>> {
    let tokens: HashMap<String, PoolHealth> = state
        .pools
        .iter()
        .map(|(name, pool)| {
            (
                name.clone(),
                PoolHealth {
                    healthy: pool.healthy(),
                    workers: pool.worker_count(),
                    healthy_workers: pool.healthy_workers(),
                    disabled: pool.is_disabled(),
                },
            )
        })
        .collect();
    let healthy = tokens.values().all(|pool| pool.healthy);
    let mut response = json_response(&HealthResponse { healthy, tokens });
    if !healthy {
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    }
    response
}

#[derive(Serialize)]
struct DirectoryKey {
    name: String,
    token: String,
    timestamp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias_to: Option<String>,
}

#[derive(Serialize)]
struct DirectoryResponse {
    keys: Vec<DirectoryKey>,
    siblings: Vec<String>,
}

fn directory(state: &AppState, principal: &Principal) -> Response<Full<Bytes>> {
    let keys = auth::visible_keys(principal, &state.config)
        .into_iter()
        .map(|key| DirectoryKey {
            name: key.name.clone(),
            token: key.token.clone().unwrap_or_default(),
            timestamp: key.timestamp,
            alias_to: key.alias_to.clone(),
        })
        .collect();
    json_response(&DirectoryResponse {
        keys,
        siblings: state.config.server.siblings.clone(),
    })
}

/// Entry point for every request on either listener.
pub(crate) async fn handle(
    state: Arc<AppState>,
    peer: Peer,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => health(&state),
        (&Method::GET, "/directory") => match authenticate(&state, &peer, &req).await {
            Ok(principal) => directory(&state, &principal),
            Err(error) => error_response(&state, &error),
        },
        (&Method::POST, p) if p.starts_with("/sign/") => {
            let key_name = p.trim_start_matches("/sign/").to_string();
            handle_sign(&state, &peer, req, key_name).await
        }
        (&Method::POST, "/sign2") => {
            let params = parse_query(req.uri().query());
            match params.get("key").cloned() {
                Some(key_name) => handle_sign(&state, &peer, req, key_name).await,
                None => text_response(
                    StatusCode::BAD_REQUEST,
                    "bad request: the 'key' query parameter is required",
                ),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "no such endpoint"),
    };

    Ok(response)
}

async fn authenticate(
    state: &AppState,
    peer: &Peer,
    req: &Request<Incoming>,
) -> Result<Principal, SignError> {
    let certificate = request_certificate(state, peer, req);
    let certificate: Option<&X509Ref> = certificate.as_deref().map(|cert| &**cert);
    state
        .auth
        .authenticate(certificate, req.uri().path(), req.method().as_str())
        .await
}

#[instrument(skip_all, fields(key = key_name, request_id = %uuid::Uuid::new_v4(), client = tracing::field::Empty))]
async fn handle_sign(
    state: &AppState,
    peer: &Peer,
    req: Request<Incoming>,
    key_name: String,
) -> Response<Full<Bytes>> {
    let Ok(_permit) = state.limiter.try_acquire() else {
        return error_response(state, &SignError::Busy);
    };

    let principal = match authenticate(state, peer, &req).await {
        Ok(principal) => principal,
        Err(error) => return error_response(state, &error),
    };
    tracing::Span::current().record("client", principal.nickname.as_str());

    let params = parse_query(req.uri().query());
    let outcome = sign_request(state, &principal, req, &key_name, &params).await;
    match outcome {
        Ok(response) => response,
        Err((error, format_label)) => {
            // Failures past authorization are audited too.
            if let Some(format_label) = format_label {
                state.audit.failure(
                    &principal.nickname,
                    &key_name,
                    format_label,
                    "",
                    &error.to_string(),
                );
            }
            error_response(state, &error)
        }
    }
}

/// The authenticated signing pipeline: authorize, fetch key info, dispatch
/// to the pool, post-process, audit.
async fn sign_request(
    state: &AppState,
    principal: &Principal,
    req: Request<Incoming>,
    key_name: &str,
    params: &HashMap<String, String>,
) -> Result<Response<Full<Bytes>>, (SignError, Option<&'static str>)> {
    let key = state
        .config
        .key(key_name)
        .ok_or((SignError::KeyNotFound(key_name.to_string()), None))?;
    auth::authorize(principal, key).map_err(|error| (error, None))?;

    let pool = state
        .pool_for(key)
        .ok_or((SignError::TokenUnavailable(key_name.to_string()), None))?;

    // An unhealthy pool is a reason to push the client toward a sibling
    // rather than let the request queue up.
    if !pool.healthy() && !state.config.server.siblings.is_empty() {
        let sibling = &state.config.server.siblings
            [rand::random_range(0..state.config.server.siblings.len())];
        let location = format!("{}/sign/{}", sibling.trim_end_matches('/'), key_name);
        let mut response = text_response(StatusCode::TEMPORARY_REDIRECT, "try a sibling");
        if let Ok(value) = location.parse() {
            response.headers_mut().insert("Location", value);
        }
        return Ok(response);
    }

    let format: SignatureFormat = match params.get("format") {
        Some(raw) => raw.parse().map_err(|e: String| (SignError::BadRequest(e), None))?,
        None => SignatureFormat::Raw,
    };
    let format_label = format.as_str();

    let info = state
        .cache
        .get(&key.name, pool)
        .await
        .map_err(|error| (error, Some(format_label)))?;

    let digest = match params.get("digest") {
        Some(raw) => raw
            .parse::<DigestAlgorithm>()
            .map_err(|e| (SignError::BadRequest(e), None))?,
        None => info.algorithm.default_digest(),
    };

    let options = SignOptions {
        format,
        digest,
        timestamp: truthy(params.get("timestamp")),
        authenticode: params.get("sigtype").map(|s| s.as_str()) == Some("authenticode"),
        payload_is_digest: params.get("payload").map(|s| s.as_str()) == Some("digest"),
        detached: truthy(params.get("detached")),
    };

    let payload = req
        .into_body()
        .collect()
        .await
        .map_err(|error| {
            (
                SignError::BadRequest(format!("failed to read the request body: {error}")),
                Some(format_label),
            )
        })?
        .to_bytes();

    let ctx = SignContext {
        key,
        info: &info,
        pool,
        timestamper: &state.timestamper,
    };
    match sign::produce(&ctx, &options, payload).await {
        Ok(artifact) => {
            state.audit.success(
                &principal.nickname,
                &key.name,
                format_label,
                &artifact.digest_hex,
            );
            let mut response = Response::new(Full::new(Bytes::from(artifact.bytes)));
            if let Ok(value) = artifact.content_type.parse() {
                response.headers_mut().insert("Content-Type", value);
            }
            Ok(response)
        }
        Err(error) => {
            state.sweep_cache();
            Err((error, Some(format_label)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing() {
        let params = parse_query(Some("format=pkcs7&timestamp=1&digest=sha384&x=a%20b"));
        assert_eq!(params.get("format").unwrap(), "pkcs7");
        assert!(truthy(params.get("timestamp")));
        assert_eq!(params.get("digest").unwrap(), "sha384");
        assert_eq!(params.get("x").unwrap(), "a b");
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn truthiness() {
        assert!(truthy(Some(&"1".to_string())));
        assert!(truthy(Some(&"true".to_string())));
        assert!(!truthy(Some(&"0".to_string())));
        assert!(!truthy(None));
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%2Fb+c"), "a/b c");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%2"), "bad%2");
    }
}
