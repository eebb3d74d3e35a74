use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    config::Config,
    error::GraphError,
    models::{NewSubscription, Subscription},
};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
// Refresh app tokens a little before Azure AD expires them.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, GraphError>;

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> Result<Subscription, GraphError>;

    // Returns `None` when the subscription no longer exists.
    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, GraphError>;

    async fn update_subscription_expiration(
        &self,
        id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<Subscription, GraphError>;

    async fn delete_subscription(&self, id: &str) -> Result<(), GraphError>;

    async fn fetch_signing_keys(&self) -> Result<JwkSet, GraphError>;

    async fn get_resource(&self, resource: &str) -> Result<serde_json::Value, GraphError>;
}

pub struct HttpGraphClient {
    http: reqwest::Client,
    graph_base_url: String,
    token_url: String,
    jwks_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

struct AccessToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct Page<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

impl HttpGraphClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.remote_timeout())
            .build()?;
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            cfg.login_base_url.trim_end_matches('/'),
            cfg.tenant_id
        );

        Ok(Self {
            http,
            graph_base_url: cfg.graph_base_url.trim_end_matches('/').to_string(),
            token_url,
            jwks_url: cfg.jwks_url.clone(),
            client_id: cfg.app_id.clone(),
            client_secret: cfg.app_password.clone(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, GraphError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        let response = ensure_success(response)
            .await
            .map_err(|err| GraphError::Auth(err.to_string()))?;
        let token: TokenResponse = response.json().await?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(expires_in = token.expires_in, "acquired app-only graph token");
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.graph_base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GraphError> {
        let token = self.access_token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

#[async_trait]
impl GraphApi for HttpGraphClient {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, GraphError> {
        let mut subscriptions = Vec::new();
        let mut next = Some(self.url("subscriptions"));
        while let Some(url) = next {
            let page: Page<Subscription> = self.get_json(&url).await?;
            subscriptions.extend(page.value);
            next = page.next_link;
        }
        Ok(subscriptions)
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> Result<Subscription, GraphError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url("subscriptions"))
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, GraphError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.url(&format!("subscriptions/{id}")))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(ensure_success(response).await?.json().await?))
    }

    async fn update_subscription_expiration(
        &self,
        id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<Subscription, GraphError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .patch(self.url(&format!("subscriptions/{id}")))
            .bearer_auth(token)
            .json(&json!({ "expirationDateTime": expiration }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn delete_subscription(&self, id: &str) -> Result<(), GraphError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(self.url(&format!("subscriptions/{id}")))
            .bearer_auth(token)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn fetch_signing_keys(&self) -> Result<JwkSet, GraphError> {
        let response = self.http.get(&self.jwks_url).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn get_resource(&self, resource: &str) -> Result<serde_json::Value, GraphError> {
        self.get_json(&self.url(resource)).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GraphError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GraphError::Status {
        status: status.as_u16(),
        body,
    })
}
