//! Structured error kinds for the hosted backend boundary.
//!
//! Auth, table and function endpoints all return JSON error bodies; the kind is
//! derived from their machine-readable code fields and the HTTP status, never
//! from the human-readable message.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("an account with this email already exists")]
    AlreadyRegistered,
    #[error("password rejected by the auth service: {0}")]
    WeakPassword(String),
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("subscription limit reached: {0}")]
    SubscriptionLimit(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("row not found")]
    NotFound,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited by the backend")]
    RateLimited,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("refusing {0}")]
    Rejected(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

impl ErrorBody {
    fn codes(&self) -> Vec<String> {
        let mut codes = Vec::new();
        if let Some(code) = &self.error_code {
            codes.push(code.clone());
        }
        match &self.code {
            Some(Value::String(s)) => codes.push(s.clone()),
            Some(Value::Number(n)) => codes.push(n.to_string()),
            _ => {}
        }
        // OAuth-style bodies put the code in `error` and the text in
        // `error_description`.
        if self.error_description.is_some() {
            if let Some(err) = &self.error {
                codes.push(err.clone());
            }
        }
        codes
    }

    fn text(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_default()
    }
}

/// Map a non-success response into an error kind.
pub fn classify(status: u16, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = {
        let text = parsed.text();
        if text.is_empty() {
            body.trim().to_string()
        } else {
            text
        }
    };

    for code in parsed.codes() {
        match code.as_str() {
            "user_already_exists" | "email_exists" | "phone_exists" | "already_registered" => {
                return BackendError::AlreadyRegistered
            }
            "weak_password" => return BackendError::WeakPassword(message),
            "invalid_credentials" | "invalid_grant" => return BackendError::InvalidCredentials,
            "subscription_limit" | "plan_limit_reached" => {
                return BackendError::SubscriptionLimit(message)
            }
            "42501" | "insufficient_privilege" => return BackendError::PermissionDenied(message),
            "PGRST116" => return BackendError::NotFound,
            "23505" => return BackendError::Conflict(message),
            "over_request_rate_limit" | "over_email_send_rate_limit" => {
                return BackendError::RateLimited
            }
            _ => {}
        }
    }

    match status {
        401 => BackendError::Unauthorized(message),
        403 => BackendError::PermissionDenied(message),
        404 => BackendError::NotFound,
        409 => BackendError::Conflict(message),
        429 => BackendError::RateLimited,
        _ => BackendError::Api {
            status,
            code: parsed.codes().into_iter().next().unwrap_or_default(),
            message,
        },
    }
}
