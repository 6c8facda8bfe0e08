//! Time-limited read URLs for stored media.
//!
//! The provider downloads the media itself, so it gets a URL carrying an
//! HS256 token scoped to one media key and expiring after `url_ttl_secs`.

use std::time::Duration;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::error::SignerError;
use crate::config::MediaConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaClaims {
    /// Media storage key.
    pub sub: String,
    pub job: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: i64,
}

pub struct MediaUrlSigner {
    base_url: String,
    key: SecretString,
    ttl: Duration,
}

impl MediaUrlSigner {
    pub fn new(config: &MediaConfig, key: SecretString) -> Self {
        Self {
            base_url: config.base_url.clone(),
            key,
            ttl: Duration::from_secs(config.url_ttl_secs),
        }
    }

    pub fn sign(&self, job_id: &str, media_ref: &str) -> Result<SignedUrl, SignerError> {
        let now = chrono::Utc::now().timestamp();
        let claims = MediaClaims {
            sub: media_ref.to_string(),
            job: job_id.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.key.expose_secret().as_bytes()),
        )?;

        let invalid = |reason: String| SignerError::InvalidUrl {
            media_ref: media_ref.to_string(),
            reason,
        };
        let base = Url::parse(&format!("{}/", self.base_url.trim_end_matches('/')))
            .map_err(|e| invalid(e.to_string()))?;
        let mut url = base
            .join(media_ref.trim_start_matches('/'))
            .map_err(|e| invalid(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", &token);

        Ok(SignedUrl {
            url: url.to_string(),
            expires_at: claims.exp,
        })
    }

    /// Checks a token presented by a media reader.
    pub fn verify(&self, token: &str) -> Result<MediaClaims, SignerError> {
        let data = decode::<MediaClaims>(
            token,
            &DecodingKey::from_secret(self.key.expose_secret().as_bytes()),
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}
