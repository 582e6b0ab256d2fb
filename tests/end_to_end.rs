// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! End-to-end signing flows against an in-process service state.
//!
//! These tests run the real pipeline, from config validation through the
//! worker pool, key-info cache, and format assembly, with a file-backed token and
//! task-isolated workers, which need no external custodian.

use std::collections::HashSet;
use std::io::Write;

use bytes::Bytes;
use custodia::auth::{self, Principal};
use custodia::config::{
    AuditConfig, ClientConfig, Config, Credentials, Isolation, KeyConfig, ServerConfig,
    TimestampConfig, TokenConfig, TokenKind,
};
use custodia::protocol::{DigestAlgorithm, SignatureFormat};
use custodia::server::service::AppState;
use custodia::sign::{self, SignContext, SignOptions};

struct Fixture {
    state: AppState,
    _key_file: tempfile::NamedTempFile,
    public_key_pem: String,
}

fn build_config(key_file: &std::path::Path) -> Config {
    Config {
        server: ServerConfig {
            listen: ":0".to_string(),
            listen_http: None,
            credentials: Credentials {
                private_key: "unused.key.pem".into(),
                certificate: "unused.cert.pem".into(),
                ca_certificate: "unused.ca.pem".into(),
            },
            siblings: vec![],
            trusted_proxies: vec![],
            policy_url: None,
            azure_ad: None,
            concurrency: 16,
            worker_executable: None,
            worker_socket_path: None,
        },
        timestamp: TimestampConfig::default(),
        audit: AuditConfig::default(),
        tokens: vec![TokenConfig {
            name: "softkey".to_string(),
            kind: TokenKind::File,
            provider: Some(key_file.display().to_string()),
            label: None,
            serial: None,
            pin: None,
            user: Default::default(),
            isolation: Isolation::Task,
            num_workers: 2,
            timeout: 10,
            retries: 3,
            check_interval: 60,
            check_timeout: 5,
            check_failures: 3,
            cache_seconds: 600,
        }],
        keys: vec![
            KeyConfig {
                name: "release".to_string(),
                token: Some("softkey".to_string()),
                roles: ["builders".to_string()].into_iter().collect(),
                ..Default::default()
            },
            KeyConfig {
                name: "release-alias".to_string(),
                alias_to: Some("release".to_string()),
                ..Default::default()
            },
        ],
        clients: vec![ClientConfig {
            fingerprint: Some("A".repeat(64)),
            certificate: None,
            nickname: "build-pipeline".to_string(),
            roles: ["builders".to_string()].into_iter().collect(),
        }],
        pin_file: None,
    }
}

fn fixture() -> Fixture {
    let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
    let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file
        .write_all(&pkey.private_key_to_pem_pkcs8().unwrap())
        .unwrap();

    let config = build_config(key_file.path()).finalize().unwrap();
    let state = AppState::new(config).unwrap();
    Fixture {
        state,
        _key_file: key_file,
        public_key_pem: String::from_utf8(pkey.public_key_to_pem().unwrap()).unwrap(),
    }
}

fn builder_principal() -> Principal {
    Principal {
        nickname: "build-pipeline".to_string(),
        roles: ["builders".to_string()].into_iter().collect(),
    }
}

fn raw_options() -> SignOptions {
    SignOptions {
        format: SignatureFormat::Raw,
        digest: DigestAlgorithm::Sha256,
        timestamp: false,
        authenticode: false,
        payload_is_digest: false,
        detached: false,
    }
}

#[tokio::test]
async fn sign_through_cache_and_pool() {
    let fixture = fixture();
    let state = &fixture.state;
    let key = state.config.key("release").unwrap();
    let pool = state.pool_for(key).unwrap();

    let info = state.cache.get("release", pool).await.unwrap();
    assert_eq!(info.public_key, fixture.public_key_pem);

    let ctx = SignContext {
        key,
        info: &info,
        pool,
        timestamper: &state.timestamper,
    };
    let payload = Bytes::from_static(b"artifact contents");
    let artifact = sign::produce(&ctx, &raw_options(), payload.clone())
        .await
        .unwrap();

    let public =
        openssl::pkey::PKey::public_key_from_pem(fixture.public_key_pem.as_bytes()).unwrap();
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), &payload).unwrap();
    let mut ctx = openssl::pkey_ctx::PkeyCtx::new(&public).unwrap();
    ctx.verify_init().unwrap();
    ctx.set_signature_md(openssl::md::Md::sha256()).unwrap();
    ctx.set_rsa_padding(openssl::rsa::Padding::PKCS1).unwrap();
    assert!(ctx.verify(&digest, &artifact.bytes).unwrap());

    for pool in state.pools.values() {
        pool.shutdown().await;
    }
}

#[tokio::test]
async fn alias_signs_with_the_primary_key() {
    let fixture = fixture();
    let state = &fixture.state;
    let principal = builder_principal();

    // The alias carries no roles of its own but inherits the target's, so
    // a client authorized for the primary may sign under the alias name.
    let alias = state.config.key("release-alias").unwrap();
    auth::authorize(&principal, alias).unwrap();

    let primary = state.config.key("release").unwrap();
    let pool = state.pool_for(alias).unwrap();
    let payload = Bytes::from_static(b"same bytes under both names");

    let mut signatures = vec![];
    for key in [alias, primary] {
        let info = state.cache.get(&key.name, pool).await.unwrap();
        let ctx = SignContext {
            key,
            info: &info,
            pool,
            timestamper: &state.timestamper,
        };
        signatures.push(
            sign::produce(&ctx, &raw_options(), payload.clone())
                .await
                .unwrap()
                .bytes,
        );
    }
    // RSA PKCS#1 v1.5 is deterministic: the same key produces the same
    // signature, so the alias provably used the primary's key material.
    assert_eq!(signatures[0], signatures[1]);

    for pool in state.pools.values() {
        pool.shutdown().await;
    }
}

#[tokio::test]
async fn unauthorized_roles_never_reach_a_worker() {
    let fixture = fixture();
    let state = &fixture.state;

    let outsider = Principal {
        nickname: "stranger".to_string(),
        roles: ["interns".to_string()].into_iter().collect(),
    };
    let key = state.config.key("release").unwrap();
    assert!(auth::authorize(&outsider, key).is_err());

    let nobody = Principal {
        nickname: "nobody".to_string(),
        roles: HashSet::new(),
    };
    assert!(auth::authorize(&nobody, key).is_err());

    for pool in state.pools.values() {
        pool.shutdown().await;
    }
}

#[tokio::test]
async fn unauthenticated_clients_are_rejected() {
    let fixture = fixture();
    let state = &fixture.state;
    let error = state
        .auth
        .authenticate(None, "/sign/release", "POST")
        .await
        .unwrap_err();
    assert!(matches!(error, custodia::error::SignError::Unauthorized));

    for pool in state.pools.values() {
        pool.shutdown().await;
    }
}

#[tokio::test]
async fn health_reflects_pool_state() {
    let fixture = fixture();
    let state = &fixture.state;
    let pool = state.pools.get("softkey").unwrap();

    // Give workers a moment to boot their sessions.
    let mut waited = 0;
    while !pool.healthy() && waited < 50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        waited += 1;
    }
    assert!(pool.healthy());
    assert_eq!(pool.worker_count(), 2);
    assert!(!state.all_pools_disabled());

    for pool in state.pools.values() {
        pool.shutdown().await;
    }
}
