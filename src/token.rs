use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{error::GraphError, graph::GraphApi};

pub const GRAPH_PUBLISHER_APP_ID: &str = "0bf30f3b-4a52-48df-9a82-234910c4a086";

const MAX_ISSUED_AT_SKEW_SECS: i64 = 300;

// Unknown key ids refetch the key set at most this often.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(jsonwebtoken::errors::Error),

    #[error("unexpected algorithm {0:?}")]
    Algorithm(Algorithm),

    #[error("token header has no key id")]
    MissingKeyId,

    #[error("no published signing key with id {0}")]
    UnknownKey(String),

    #[error("signing keys unavailable: {0}")]
    KeySet(#[from] GraphError),

    #[error("claims rejected: {0}")]
    Claims(jsonwebtoken::errors::Error),

    #[error("issued in the future")]
    IssuedInFuture,

    #[error("unexpected publisher {0:?}")]
    Publisher(Option<String>),
}

#[derive(Debug, Deserialize)]
struct PublisherClaims {
    #[serde(default)]
    appid: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
}

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

impl KeyCache {
    fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|at| at.elapsed())
    }
}

pub struct TokenVerifier {
    api: Arc<dyn GraphApi>,
    audience: String,
    publisher_app_id: String,
    cache_ttl: Duration,
    keys: Mutex<KeyCache>,
}

impl TokenVerifier {
    pub fn new(
        api: Arc<dyn GraphApi>,
        audience: impl Into<String>,
        publisher_app_id: impl Into<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            api,
            audience: audience.into(),
            publisher_app_id: publisher_app_id.into(),
            cache_ttl,
            keys: Mutex::new(KeyCache::default()),
        }
    }

    pub async fn verify(&self, token: &str) -> bool {
        match self.try_verify(token).await {
            Ok(()) => true,
            Err(err) => {
                warn!(reason = %err, "validation token rejected");
                false
            }
        }
    }

    async fn try_verify(&self, token: &str) -> Result<(), TokenError> {
        let header = decode_header(token).map_err(TokenError::Malformed)?;
        if header.alg != Algorithm::RS256 {
            return Err(TokenError::Algorithm(header.alg));
        }
        let kid = header.kid.ok_or(TokenError::MissingKeyId)?;
        let key = self.signing_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        validation.validate_nbf = true;

        let data = decode::<PublisherClaims>(token, &key, &validation).map_err(TokenError::Claims)?;
        if let Some(iat) = data.claims.iat {
            if iat > Utc::now().timestamp() + MAX_ISSUED_AT_SKEW_SECS {
                return Err(TokenError::IssuedInFuture);
            }
        }
        if data.claims.appid.as_deref() != Some(self.publisher_app_id.as_str()) {
            return Err(TokenError::Publisher(data.claims.appid));
        }
        Ok(())
    }

    async fn signing_key(&self, kid: &str) -> Result<DecodingKey, TokenError> {
        let mut cache = self.keys.lock().await;
        if let Some(age) = cache.age().filter(|age| *age < self.cache_ttl) {
            if let Some(key) = cache.keys.get(kid) {
                return Ok(key.clone());
            }
            if age < MIN_REFRESH_INTERVAL {
                return Err(TokenError::UnknownKey(kid.to_string()));
            }
        }

        let set = self.api.fetch_signing_keys().await?;
        cache.keys.clear();
        cache.fetched_at = Some(Instant::now());
        for jwk in &set.keys {
            let Some(id) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    cache.keys.insert(id, key);
                }
                Err(err) => debug!(kid = %id, error = %err, "skipping unusable signing key"),
            }
        }
        debug!(count = cache.keys.len(), "refreshed signing keys");

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| TokenError::UnknownKey(kid.to_string()))
    }
}
