use std::{env, time::Duration};

#[derive(Clone)]
pub struct Config {
    pub bind_addr: String,
    pub tenant_id: String,
    pub app_id: String,
    pub app_password: String,
    pub webhook_url: String,
    pub notification_lifetime_secs: i64,
    pub client_state: String,
    pub private_key_path: String,
    pub encryption_certificate: String,
    pub encryption_certificate_id: String,
    pub graph_base_url: String,
    pub login_base_url: String,
    pub jwks_url: String,
    pub remote_timeout_ms: u64,
    pub signing_key_cache_secs: u64,
    pub recreate_on_removed: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port: u16 = env_or_parse("PORT", 3978)?;
        let bind_addr = env_or("BIND_ADDR", &format!("0.0.0.0:{port}"));
        let tenant_id = env_required("TENANT_ID")?;
        let app_id = env_required("APP_ID")?;
        let app_password = env_required("APP_PASSWORD")?;
        let webhook_url = env_required("WEBHOOK_URL")?;
        let notification_lifetime_secs = env_or_parse("NOTIFICATION_LIFETIME_SECS", 1800)?;
        // Shared with Graph on subscribe; every notification must echo it back.
        let client_state = env_required("CLIENT_STATE")?;
        let private_key_path = env_or("NOTIFICATION_PRIVATE_KEY_PATH", "notifications.key");
        let encryption_certificate = env_required("NOTIFICATION_PUBLIC_KEY")?;
        let encryption_certificate_id = env_required("NOTIFICATION_KEY_ID")?;
        let graph_base_url = env_or("GRAPH_BASE_URL", "https://graph.microsoft.com/v1.0");
        let login_base_url = env_or("LOGIN_BASE_URL", "https://login.microsoftonline.com");
        let jwks_url = env_or(
            "JWKS_URL",
            "https://login.microsoftonline.com/common/discovery/keys",
        );
        let remote_timeout_ms = env_or_parse("REMOTE_TIMEOUT_MS", 10_000)?;
        let signing_key_cache_secs = env_or_parse("SIGNING_KEY_CACHE_SECS", 300)?;
        let recreate_on_removed = env_or_parse("RECREATE_ON_REMOVED", false)?;

        // Guardrail checks for nonsensical configuration.
        if notification_lifetime_secs <= 0 {
            return Err(anyhow::anyhow!("NOTIFICATION_LIFETIME_SECS must be > 0"));
        }
        if client_state.trim().is_empty() {
            return Err(anyhow::anyhow!("CLIENT_STATE must not be empty"));
        }
        if remote_timeout_ms == 0 {
            return Err(anyhow::anyhow!("REMOTE_TIMEOUT_MS must be > 0"));
        }

        Ok(Self {
            bind_addr,
            tenant_id,
            app_id,
            app_password,
            webhook_url,
            notification_lifetime_secs,
            client_state,
            private_key_path,
            encryption_certificate,
            encryption_certificate_id,
            graph_base_url,
            login_base_url,
            jwks_url,
            remote_timeout_ms,
            signing_key_cache_secs,
            recreate_on_removed,
        })
    }

    pub fn notification_url(&self) -> String {
        format!("{}/notifications", self.webhook_url.trim_end_matches('/'))
    }

    pub fn lifecycle_url(&self) -> String {
        format!(
            "{}/notifications/lifecycle",
            self.webhook_url.trim_end_matches('/')
        )
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn notification_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.notification_lifetime_secs)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("{key} is required"))
}

fn env_or_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:3978".to_string(),
        tenant_id: "tenant".to_string(),
        app_id: "11111111-2222-3333-4444-555555555555".to_string(),
        app_password: "secret".to_string(),
        webhook_url: "https://hooks.example.com/".to_string(),
        notification_lifetime_secs: 1800,
        client_state: "shared-client-state".to_string(),
        private_key_path: "notifications.key".to_string(),
        encryption_certificate: "Y2VydA==".to_string(),
        encryption_certificate_id: "cert-1".to_string(),
        graph_base_url: "https://graph.example.com/v1.0".to_string(),
        login_base_url: "https://login.example.com".to_string(),
        jwks_url: "https://login.example.com/common/discovery/keys".to_string(),
        remote_timeout_ms: 1000,
        signing_key_cache_secs: 300,
        recreate_on_removed: false,
    }
}
