// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the custodia server, worker pool, and token backends.

use hyper::StatusCode;

/// How a custodian failure should be treated by the layers above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The operation may succeed if retried on a fresh session.
    Transient,
    /// Retrying will not help; surface the error to the caller.
    Permanent,
    /// The custodian wants credentials it was not given.
    AuthRequired,
}

/// Errors produced by token backends (PKCS#11, scdaemon, key files, cloud KMS).
///
/// The worker pool consumes the [`BackendError::classify`] result to decide
/// whether to retry a request on a respawned worker, fail it, or disable the
/// pool entirely.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The provider library is absent, credentials were rejected, or the
    /// remote endpoint is unreachable. Opening the session again later may
    /// succeed.
    #[error("token backend unavailable: {0}")]
    Unavailable(String),

    /// No key matched the descriptor's selectors.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// More than one key matched the descriptor's selectors. The descriptor
    /// must be narrowed; retrying is pointless.
    #[error("key selector matched more than one object: {0}")]
    SelectorAmbiguous(String),

    /// The custodian refused to produce a signature, e.g. because of a key
    /// usage policy. Never retried.
    #[error("custodian refused to sign: {0}")]
    SigningRefused(String),

    /// The custodian session died mid-operation. The pool transparently
    /// retries these on a freshly-respawned worker.
    #[error("custodian session lost: {0}")]
    SessionLost(String),

    /// The operation exceeded the per-request deadline. The worker carrying
    /// it is replaced, since an in-flight custodian call cannot be
    /// cancelled.
    #[error("custodian operation timed out")]
    Timeout,

    /// An unrecoverable failure; the owning pool is disabled.
    #[error("fatal custodian error: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            BackendError::Unavailable(_) | BackendError::SessionLost(_) | BackendError::Timeout => {
                ErrorClass::Transient
            }
            BackendError::KeyNotFound(_)
            | BackendError::SelectorAmbiguous(_)
            | BackendError::Fatal(_) => ErrorClass::Permanent,
            BackendError::SigningRefused(_) => ErrorClass::AuthRequired,
        }
    }
}

/// Errors surfaced to the signing client over HTTP.
///
/// Internal conditions the server recovers from on its own
/// ([`BackendError::SessionLost`], malformed-archive parse failures) never
/// appear here directly: retries consume the former and the latter map to
/// [`SignError::BadRequest`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("no such key: {0}")]
    KeyNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("server is at its concurrency limit")]
    Busy,

    #[error("request deadline exceeded")]
    Timeout,

    /// All of the token's workers are sick and none recovered within the
    /// request deadline. Clients should retry after a delay.
    #[error("token {0} is unavailable")]
    TokenUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SignError {
    pub fn status(&self) -> StatusCode {
        match self {
            SignError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SignError::Unauthorized => StatusCode::UNAUTHORIZED,
            SignError::Forbidden(_) => StatusCode::FORBIDDEN,
            SignError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            SignError::Conflict(_) => StatusCode::CONFLICT,
            SignError::Busy | SignError::TokenUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SignError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SignError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BackendError> for SignError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::KeyNotFound(key) => SignError::KeyNotFound(key),
            BackendError::SigningRefused(reason) => SignError::Forbidden(reason),
            BackendError::Timeout => SignError::Timeout,
            BackendError::Unavailable(token) | BackendError::SessionLost(token) => {
                SignError::TokenUnavailable(token)
            }
            other => SignError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<crate::zip::ZipError> for SignError {
    fn from(error: crate::zip::ZipError) -> Self {
        SignError::BadRequest(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            BackendError::SessionLost("hsm".into()).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            BackendError::KeyNotFound("release".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            BackendError::SigningRefused("usage policy".into()).classify(),
            ErrorClass::AuthRequired
        );
        assert_eq!(BackendError::Timeout.classify(), ErrorClass::Transient);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            SignError::TokenUnavailable("hsm".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(SignError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            SignError::from(BackendError::KeyNotFound("k".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
