//! Optional admin API sync. Mirrors managed services into the tailnet's
//! VIP service registry so tags and ownership show up in the admin console.
//! Failures here never fail a reconcile pass; callers log and move on.

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::REQUEST_ID_HEADER;
use crate::service::DesiredService;

/// Seconds shaved off a token lifetime so a token is refreshed before it
/// expires mid-request.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub enum ApiAuth {
    ApiKey(String),
    OAuth {
        client_id: String,
        client_secret: String,
    },
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tailnet: String,
    auth: ApiAuth,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, tailnet: impl Into<String>, auth: ApiAuth) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            tailnet: tailnet.into(),
            auth,
            token: Mutex::new(None),
        }
    }

    pub async fn upsert_service(&self, service: &DesiredService) -> anyhow::Result<()> {
        let qualified = service.qualified_name();
        let url = self.service_url(&qualified);
        let body = VipService {
            name: qualified.clone(),
            tags: service.tags.clone(),
            ports: service_ports(service),
            comment: format!(
                "managed by tailbridge (container {})",
                service.container_name
            ),
        };

        let request = self
            .http
            .put(&url)
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string())
            .json(&body);
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .context("admin api upsert request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, service = %qualified, "admin api upsert rejected");
            bail!("admin api upsert failed: {status}, body: {body}");
        }

        debug!(service = %qualified, "admin api upsert applied");
        Ok(())
    }

    /// Deletes the registry entry; a missing entry is success.
    pub async fn delete_service(&self, qualified_name: &str) -> anyhow::Result<()> {
        let url = self.service_url(qualified_name);
        let request = self
            .http
            .delete(&url)
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .context("admin api delete request failed")?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(service = qualified_name, "admin api entry already absent");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("admin api delete failed: {status}, body: {body}");
        }

        Ok(())
    }

    fn service_url(&self, qualified_name: &str) -> String {
        format!(
            "{}/api/v2/tailnet/{}/vip-services/{}",
            self.base_url, self.tailnet, qualified_name
        )
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        match &self.auth {
            ApiAuth::ApiKey(key) => Ok(request.basic_auth(key, Some(""))),
            ApiAuth::OAuth { .. } => {
                let token = self.access_token().await?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.access_token.clone());
            }
        }

        let ApiAuth::OAuth {
            client_id,
            client_secret,
        } = &self.auth
        else {
            bail!("oauth token requested without oauth credentials");
        };

        let url = format!("{}/api/v2/oauth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .context("oauth token request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("oauth token request failed: {status}, body: {body}");
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("failed to decode oauth token response")?;
        let lifetime = token.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        let expires_at = Utc::now() + chrono::Duration::seconds(lifetime as i64);
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });

        Ok(access_token)
    }
}

/// Best-effort registry upsert for callers that must not fail on API errors.
pub async fn upsert_registry_entry(api: Option<&ApiClient>, service: &DesiredService) {
    let Some(api) = api else {
        return;
    };
    if let Err(error) = api.upsert_service(service).await {
        warn!(service = %service.qualified_name(), %error, "admin api upsert failed");
    }
}

/// Best-effort registry delete, same contract as [`upsert_registry_entry`].
pub async fn remove_registry_entry(api: Option<&ApiClient>, qualified_name: &str) {
    let Some(api) = api else {
        return;
    };
    if let Err(error) = api.delete_service(qualified_name).await {
        warn!(service = qualified_name, %error, "admin api delete failed");
    }
}

/// Ports advertised on the registry entry: the service port plus the funnel
/// port when one exists.
fn service_ports(service: &DesiredService) -> Vec<String> {
    let mut ports = vec![format!("tcp:{}", service.service_port)];
    if let Some(funnel) = &service.funnel {
        let funnel_port = format!("tcp:{}", funnel.public_port);
        if !ports.contains(&funnel_port) {
            ports.push(funnel_port);
        }
    }
    ports
}

#[derive(Debug, Serialize)]
struct VipService {
    name: String,
    tags: Vec<String>,
    ports: Vec<String>,
    comment: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}
