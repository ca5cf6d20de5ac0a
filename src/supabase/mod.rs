use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;

pub mod error;
pub mod query;

pub use error::BackendError;
pub use query::{Filter, Query};

pub type BackendResult<T> = Result<T, BackendError>;

/// Table, RPC and function access against the hosted database.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>>;

    async fn insert(&self, table: &str, rows: Value) -> BackendResult<Vec<Value>>;

    async fn update(&self, table: &str, query: &Query, patch: Value) -> BackendResult<Vec<Value>>;

    async fn delete(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>>;

    async fn rpc(&self, name: &str, args: Value) -> BackendResult<Value>;

    async fn invoke_function(&self, name: &str, bearer: &str, body: Value) -> BackendResult<Value>;
}

/// Hosted-auth session as returned by the token endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct HostedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Password-based hosted authentication.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> BackendResult<HostedSession>;

    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<HostedSession>;

    async fn sign_out(&self, access_token: &str) -> BackendResult<()>;

    /// Token used for subsequent row-level-security filtered requests.
    fn set_access_token(&self, _token: Option<String>) {}
}

#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: Url,
    anon_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    pub fn new(base_url: &str, anon_key: String) -> BackendResult<Self> {
        // `join` drops the last segment unless the base ends with a slash.
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&base)?;
        let http = Client::builder()
            .user_agent(concat!("school-admin/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            anon_key,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn from_config(cfg: &Config) -> BackendResult<Self> {
        Self::new(&cfg.supabase.url, cfg.supabase.anon_key.clone())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    /// Build a request against `path` (relative to the project URL).
    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        bearer: Option<&str>,
        body: Option<&Value>,
    ) -> BackendResult<reqwest::Request> {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        let token = bearer.map(str::to_string).unwrap_or_else(|| self.bearer());
        let mut builder = self
            .http
            .request(method.clone(), url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", token));
        if path.starts_with("rest/v1/") && method != Method::GET {
            builder = builder.header("Prefer", "return=representation");
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> BackendResult<String> {
        debug!(method = %request.method(), url = %request.url(), "backend request");
        for (name, value) in request.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if lowered == "authorization" || lowered == "apikey" {
                debug!("  {}: [REDACTED]", name);
            } else {
                debug!("  {}: {}", name, value.to_str().unwrap_or("[invalid]"));
            }
        }

        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        debug!(%status, bytes = body.len(), "backend response");

        if !status.is_success() {
            warn!(%status, body = %body, "backend error");
            return Err(error::classify(status.as_u16(), &body));
        }
        Ok(body)
    }

    async fn execute_rows(&self, request: reqwest::Request) -> BackendResult<Vec<Value>> {
        let body = self.execute(request).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    async fn token_request(&self, grant_type: &str, body: Value) -> BackendResult<HostedSession> {
        let params = vec![("grant_type".to_string(), grant_type.to_string())];
        let request = self.build_request(
            Method::POST,
            "auth/v1/token",
            &params,
            Some(&self.anon_key),
            Some(&body),
        )?;
        let body = self.execute(request).await?;
        let payload: TokenResponse = serde_json::from_str(&body)?;
        Ok(payload.into_session())
    }

    /// Fetch the hosted-auth user behind an access token.
    pub async fn get_user(&self, access_token: &str) -> BackendResult<Value> {
        let request =
            self.build_request(Method::GET, "auth/v1/user", &[], Some(access_token), None)?;
        let body = self.execute(request).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Backend for SupabaseClient {
    #[instrument(skip_all, fields(table = %table))]
    async fn select(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>> {
        let path = format!("rest/v1/{}", table);
        let request = self.build_request(Method::GET, &path, &query.to_params(), None, None)?;
        self.execute_rows(request).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn insert(&self, table: &str, rows: Value) -> BackendResult<Vec<Value>> {
        let path = format!("rest/v1/{}", table);
        let request = self.build_request(Method::POST, &path, &[], None, Some(&rows))?;
        self.execute_rows(request).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn update(&self, table: &str, query: &Query, patch: Value) -> BackendResult<Vec<Value>> {
        if !query.has_filters() {
            return Err(BackendError::Rejected("an update without filters"));
        }
        let path = format!("rest/v1/{}", table);
        let params: Vec<(String, String)> = query
            .to_params()
            .into_iter()
            .filter(|(k, _)| k != "order" && k != "limit")
            .collect();
        let request = self.build_request(Method::PATCH, &path, &params, None, Some(&patch))?;
        self.execute_rows(request).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn delete(&self, table: &str, query: &Query) -> BackendResult<Vec<Value>> {
        if !query.has_filters() {
            return Err(BackendError::Rejected("a delete without filters"));
        }
        let path = format!("rest/v1/{}", table);
        let params: Vec<(String, String)> = query
            .to_params()
            .into_iter()
            .filter(|(k, _)| k != "order" && k != "limit")
            .collect();
        let request = self.build_request(Method::DELETE, &path, &params, None, None)?;
        self.execute_rows(request).await
    }

    #[instrument(skip_all, fields(name = %name))]
    async fn rpc(&self, name: &str, args: Value) -> BackendResult<Value> {
        let path = format!("rest/v1/rpc/{}", name);
        let request = self.build_request(Method::POST, &path, &[], None, Some(&args))?;
        let body = self.execute(request).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    #[instrument(skip_all, fields(name = %name))]
    async fn invoke_function(&self, name: &str, bearer: &str, body: Value) -> BackendResult<Value> {
        let path = format!("functions/v1/{}", name);
        let request = self.build_request(Method::POST, &path, &[], Some(bearer), Some(&body))?;
        let body = self.execute(request).await?;
        let payload: Value = serde_json::from_str(&body)?;
        // Functions may answer 200 with an `{error}` body.
        if payload.get("error").is_some_and(|e| !e.is_null()) {
            return Err(error::classify(400, &payload.to_string()));
        }
        info!(function = name, "function invoked");
        Ok(payload)
    }
}

#[async_trait]
impl AuthApi for SupabaseClient {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BackendResult<HostedSession> {
        self.token_request("password", json!({ "email": email, "password": password }))
            .await
    }

    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<HostedSession> {
        self.token_request("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }

    async fn sign_out(&self, access_token: &str) -> BackendResult<()> {
        let request =
            self.build_request(Method::POST, "auth/v1/logout", &[], Some(access_token), None)?;
        self.execute(request).await?;
        Ok(())
    }

    fn set_access_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.access_token.write() {
            *guard = token;
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self) -> HostedSession {
        let expires_at = self
            .expires_at
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(|| {
                Utc::now() + chrono::Duration::seconds(self.expires_in.unwrap_or(3600))
            });
        HostedSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id: self.user.id,
            email: self.user.email,
        }
    }
}
