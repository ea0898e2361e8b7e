//! Firebase ID token verification for the external sign-in endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const CLOCK_SKEW_SECS: u64 = 60;
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Identity asserted by the external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub subject_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub sign_in_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("assertion is malformed")]
    Malformed,
    #[error("assertion has expired")]
    Expired,
    #[error("assertion is not trusted: {0}")]
    Untrusted(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, assertion: &str) -> Result<ExternalIdentity, VerificationError>;
}

#[derive(Clone)]
enum VerifierMode {
    Firebase,
    StaticKey {
        kid: String,
        algorithm: Algorithm,
        decoding_key: Arc<DecodingKey>,
    },
}

#[derive(Clone)]
struct JwksCacheEntry {
    keys_by_kid: HashMap<String, Arc<DecodingKey>>,
    fetched_at: Instant,
    expires_at: Instant,
}

pub struct FirebaseVerifier {
    http_client: reqwest::Client,
    project_id: String,
    jwks_url: String,
    mode: VerifierMode,
    jwks_cache: RwLock<Option<JwksCacheEntry>>,
    refresh_lock: Mutex<()>,
}

impl FirebaseVerifier {
    /// Production verifier backed by Google's securetoken key set.
    pub fn new(project_id: &str) -> anyhow::Result<Self> {
        Self::with_jwks_url(project_id, FIREBASE_JWKS_URL)
    }

    fn with_jwks_url(project_id: &str, jwks_url: &str) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .context("failed building identity HTTP client")?;

        tracing::info!(project_id = %project_id, "initialized Firebase token verifier");

        Ok(Self {
            http_client,
            project_id: project_id.to_string(),
            jwks_url: jwks_url.to_string(),
            mode: VerifierMode::Firebase,
            jwks_cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Verifier with a fixed key, for local development and tests.
    pub fn new_with_static_key(
        project_id: &str,
        kid: impl Into<String>,
        algorithm: Algorithm,
        decoding_key: DecodingKey,
    ) -> anyhow::Result<Self> {
        let kid = kid.into();
        if kid.trim().is_empty() {
            anyhow::bail!("static key id must not be empty");
        }
        let mut verifier = Self::new(project_id)?;
        verifier.mode = VerifierMode::StaticKey {
            kid,
            algorithm,
            decoding_key: Arc::new(decoding_key),
        };
        Ok(verifier)
    }

    fn issuer(&self) -> String {
        format!("https://securetoken.google.com/{}", self.project_id)
    }

    fn expected_algorithm(&self) -> Algorithm {
        match &self.mode {
            VerifierMode::Firebase => Algorithm::RS256,
            VerifierMode::StaticKey { algorithm, .. } => *algorithm,
        }
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<Arc<DecodingKey>, VerificationError> {
        if let VerifierMode::StaticKey {
            kid: static_kid,
            decoding_key,
            ..
        } = &self.mode
        {
            if kid == static_kid {
                return Ok(decoding_key.clone());
            }
            return Err(VerificationError::Untrusted(format!("unknown key id: {kid}")));
        }

        if let Some(key) = self.lookup_cached_key(kid).await {
            return Ok(key);
        }

        self.refresh_jwks(kid).await?;
        self.lookup_cached_key(kid)
            .await
            .ok_or_else(|| VerificationError::Untrusted(format!("unknown key id: {kid}")))
    }

    async fn lookup_cached_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        let cache = self.jwks_cache.read().await;
        let now = Instant::now();
        cache
            .as_ref()
            .filter(|entry| entry.expires_at > now)
            .and_then(|entry| entry.keys_by_kid.get(kid))
            .cloned()
    }

    async fn refresh_jwks(&self, kid: &str) -> Result<(), VerificationError> {
        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        {
            let cache = self.jwks_cache.read().await;
            let now = Instant::now();
            if let Some(entry) = cache.as_ref().filter(|entry| entry.expires_at > now) {
                if entry.keys_by_kid.contains_key(kid)
                    || now.duration_since(entry.fetched_at) < MIN_REFRESH_INTERVAL
                {
                    return Ok(());
                }
            }
        }

        tracing::debug!(jwks_url = %self.jwks_url, "refreshing Firebase key set");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| VerificationError::Unavailable(format!("key set request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VerificationError::Unavailable(format!(
                "key set request returned status {}",
                response.status()
            )));
        }

        let ttl = cache_ttl_from_headers(response.headers(), DEFAULT_CACHE_TTL);

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| VerificationError::Unavailable(format!("invalid key set JSON: {e}")))?;

        let keys_by_kid = usable_keys(jwks);
        if keys_by_kid.is_empty() {
            return Err(VerificationError::Unavailable(
                "key set did not include any usable RSA keys".to_string(),
            ));
        }

        let fetched_at = Instant::now();
        *self.jwks_cache.write().await = Some(JwksCacheEntry {
            keys_by_kid,
            fetched_at,
            expires_at: fetched_at + ttl,
        });

        tracing::debug!(ttl_secs = ttl.as_secs(), "Firebase key set cached");
        Ok(())
    }
}

#[async_trait]
impl IdentityVerifier for FirebaseVerifier {
    async fn verify(&self, assertion: &str) -> Result<ExternalIdentity, VerificationError> {
        let header = decode_header(assertion).map_err(|_| VerificationError::Malformed)?;

        let expected = self.expected_algorithm();
        if header.alg != expected {
            return Err(VerificationError::Untrusted(format!(
                "unexpected alg: {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| VerificationError::Untrusted("missing kid".to_string()))?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(expected);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&[self.issuer()]);
        validation.set_audience(&[self.project_id.as_str()]);
        validation.leeway = CLOCK_SKEW_SECS;

        let claims = decode::<FirebaseClaims>(assertion, decoding_key.as_ref(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => VerificationError::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => VerificationError::Malformed,
                _ => VerificationError::Untrusted(format!("validation failed: {e}")),
            })?
            .claims;

        validate_iat(claims.iat)?;

        if claims.sub.trim().is_empty() {
            return Err(VerificationError::Untrusted("empty sub claim".to_string()));
        }

        let email = claims
            .email
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| VerificationError::Untrusted("missing email claim".to_string()))?;

        match claims.email_verified {
            Some(true) => {}
            Some(false) => {
                return Err(VerificationError::Untrusted(
                    "email_verified claim is false".to_string(),
                ));
            }
            None => {
                return Err(VerificationError::Untrusted(
                    "email_verified claim is missing".to_string(),
                ));
            }
        }

        tracing::debug!(
            subject = %claims.sub,
            sign_in_provider = ?claims.firebase.as_ref().map(|f| &f.sign_in_provider),
            "external assertion verified"
        );

        Ok(ExternalIdentity {
            subject_id: claims.sub,
            email,
            display_name: claims.name,
            avatar_url: claims.picture,
            sign_in_provider: claims.firebase.map(|f| f.sign_in_provider),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    alg: Option<String>,
    n: String,
    e: String,
    #[serde(rename = "use")]
    use_: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirebaseClaims {
    sub: String,
    iat: Option<u64>,
    email: Option<String>,
    email_verified: Option<bool>,
    name: Option<String>,
    picture: Option<String>,
    firebase: Option<FirebaseInfo>,
}

#[derive(Debug, Deserialize)]
struct FirebaseInfo {
    sign_in_provider: String,
}

fn usable_keys(jwks: Jwks) -> HashMap<String, Arc<DecodingKey>> {
    let mut keys_by_kid = HashMap::new();
    for jwk in jwks.keys {
        if jwk.kty != "RSA" || jwk.kid.trim().is_empty() {
            continue;
        }
        if jwk.alg.as_deref().is_some_and(|alg| alg != "RS256") {
            continue;
        }
        if jwk.use_.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }
        match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
            Ok(key) => {
                keys_by_kid.insert(jwk.kid, Arc::new(key));
            }
            Err(e) => {
                tracing::warn!(error = %e, kid = %jwk.kid, "skipping invalid RSA key");
            }
        }
    }
    keys_by_kid
}

fn validate_iat(iat: Option<u64>) -> Result<(), VerificationError> {
    let Some(iat) = iat else {
        return Err(VerificationError::Untrusted("missing iat claim".to_string()));
    };
    if iat > now_unix_secs() + CLOCK_SKEW_SECS {
        return Err(VerificationError::Untrusted(
            "iat claim is in the future".to_string(),
        ));
    }
    Ok(())
}

fn cache_ttl_from_headers(headers: &reqwest::header::HeaderMap, fallback: Duration) -> Duration {
    headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_cache_control_max_age)
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn parse_cache_control_max_age(value: &str) -> Option<u64> {
    value
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|raw| raw.trim_matches('"').parse::<u64>().ok())
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
