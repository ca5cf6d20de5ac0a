//! Signed-in state for the console.
//!
//! Admins and principals authenticate against the hosted auth service with a
//! password; every other role signs in with a PIN checked by the `verify_pin`
//! procedure and gets a local session without a token. The session and the
//! caller's profile are persisted in the local store so a restart resumes
//! where it left off.
//!
//! Profile resolution is single-flight per session id: duplicate or
//! concurrent `SignedIn` / `TokenRefreshed` notifications for one session
//! share a single lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, CachedProfile, Pool, SessionKind, StoredSession};
use crate::gateway::ApiGateway;
use crate::model::UserProfile;
use crate::supabase::{AuthApi, BackendError, HostedSession, Query};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} accounts must use the other sign-in method")]
    WrongAuthPath(&'static str),
    #[error("invalid email or PIN")]
    InvalidCredentials,
    #[error("account is deactivated")]
    Inactive,
    #[error("no profile found for user {0}")]
    NoProfile(Uuid),
    #[error("not signed in")]
    NotSignedIn,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub session: StoredSession,
    pub profile: UserProfile,
}

/// Notifications from the hosted auth client.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn(StoredSession),
    TokenRefreshed(StoredSession),
    SignedOut,
}

type Inflight = Arc<OnceCell<UserProfile>>;

pub struct SessionManager {
    auth: Arc<dyn AuthApi>,
    gateway: ApiGateway,
    pool: Pool,
    profile_ttl: chrono::Duration,
    state: RwLock<Option<AuthState>>,
    inflight: Mutex<HashMap<String, Inflight>>,
}

fn hosted_to_stored(session: HostedSession) -> StoredSession {
    StoredSession {
        session_id: Uuid::new_v4().to_string(),
        kind: SessionKind::Hosted,
        user_id: session.user_id,
        email: session.email,
        access_token: Some(session.access_token),
        refresh_token: Some(session.refresh_token),
        expires_at: Some(session.expires_at),
    }
}

/// `verify_pin` answers with a profile object, a one-element array or null.
fn profile_from_rpc(value: Value) -> SessionResult<Option<UserProfile>> {
    let value = match value {
        Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        Value::Array(_) | Value::Null => return Ok(None),
        other => other,
    };
    let profile = serde_json::from_value(value).map_err(BackendError::from)?;
    Ok(Some(profile))
}

fn check_path(profile: &UserProfile, hosted: bool) -> SessionResult<()> {
    if profile.role.uses_hosted_auth() != hosted {
        return Err(SessionError::WrongAuthPath(profile.role.as_str()));
    }
    if !profile.is_active {
        return Err(SessionError::Inactive);
    }
    Ok(())
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthApi>, gateway: ApiGateway, pool: Pool, profile_ttl: Duration) -> Self {
        Self {
            auth,
            gateway,
            pool,
            profile_ttl: chrono::Duration::from_std(profile_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            state: RwLock::new(None),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn current(&self) -> Option<AuthState> {
        self.state.read().await.clone()
    }

    /// Bearer token for calls that need the caller's identity.
    pub async fn access_token(&self) -> SessionResult<String> {
        self.state
            .read()
            .await
            .as_ref()
            .and_then(|s| s.session.access_token.clone())
            .ok_or(SessionError::NotSignedIn)
    }

    #[instrument(skip_all)]
    pub async fn sign_in_password(&self, email: &str, password: &str) -> SessionResult<AuthState> {
        let hosted = self.auth.sign_in_with_password(email.trim(), password).await?;
        let session = hosted_to_stored(hosted);
        self.auth.set_access_token(session.access_token.clone());
        let state = self
            .handle_auth_event(AuthEvent::SignedIn(session))
            .await?
            .ok_or(SessionError::NotSignedIn)?;
        info!(user_id = %state.profile.id, "signed in with password");
        Ok(state)
    }

    #[instrument(skip_all)]
    pub async fn sign_in_pin(&self, email: &str, pin: &str) -> SessionResult<AuthState> {
        let value = self
            .gateway
            .rpc("verify_pin", json!({ "p_email": email.trim(), "p_pin": pin }))
            .await
            .map_err(|err| match err {
                BackendError::InvalidCredentials | BackendError::NotFound => {
                    SessionError::InvalidCredentials
                }
                other => other.into(),
            })?;
        let profile = profile_from_rpc(value)?.ok_or(SessionError::InvalidCredentials)?;
        check_path(&profile, false)?;

        let session = StoredSession {
            session_id: Uuid::new_v4().to_string(),
            kind: SessionKind::Pin,
            user_id: profile.id,
            email: profile.email.clone(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
        };
        db::put_profile(&self.pool, &profile, Utc::now()).await?;
        db::save_session(&self.pool, &session).await?;
        self.auth.set_access_token(None);
        self.lock_inflight()
            .insert(session.session_id.clone(), Arc::new(OnceCell::new_with(Some(profile.clone()))));
        let state = AuthState { session, profile };
        *self.state.write().await = Some(state.clone());
        info!(user_id = %state.profile.id, "signed in with pin");
        Ok(state)
    }

    /// Restore the persisted session, if any.
    #[instrument(skip_all)]
    pub async fn bootstrap(&self) -> SessionResult<Option<AuthState>> {
        let Some(mut session) = db::load_session(&self.pool).await? else {
            debug!("no persisted session");
            return Ok(None);
        };
        if session.kind == SessionKind::Hosted && session.is_expired(Utc::now()) {
            let refreshed = match session.refresh_token.as_deref() {
                Some(token) => self.auth.refresh_session(token).await,
                None => Err(BackendError::Unauthorized("missing refresh token".into())),
            };
            match refreshed {
                Ok(hosted) => {
                    session.access_token = Some(hosted.access_token);
                    session.refresh_token = Some(hosted.refresh_token);
                    session.expires_at = Some(hosted.expires_at);
                    db::save_session(&self.pool, &session).await?;
                    info!("expired session refreshed");
                }
                Err(err) => {
                    warn!(?err, "session refresh failed; signing out");
                    self.clear_local().await?;
                    return Ok(None);
                }
            }
        }
        self.auth.set_access_token(session.access_token.clone());
        let state = self.admit(session).await?;
        Ok(Some(state))
    }

    #[instrument(skip_all)]
    pub async fn handle_auth_event(&self, event: AuthEvent) -> SessionResult<Option<AuthState>> {
        match event {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => {
                db::save_session(&self.pool, &session).await?;
                self.auth.set_access_token(session.access_token.clone());
                Ok(Some(self.admit(session).await?))
            }
            AuthEvent::SignedOut => {
                self.clear_local().await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn sign_out(&self) -> SessionResult<()> {
        let token = self
            .state
            .read()
            .await
            .as_ref()
            .filter(|s| s.session.kind == SessionKind::Hosted)
            .and_then(|s| s.session.access_token.clone());
        if let Some(token) = token {
            if let Err(err) = self.auth.sign_out(&token).await {
                warn!(?err, "remote sign-out failed");
            }
        }
        self.clear_local().await?;
        info!("signed out");
        Ok(())
    }

    /// Resolve the profile and install the session, unless the profile is
    /// inactive or belongs to the other sign-in method. A refused session is
    /// signed out and cleared.
    async fn admit(&self, session: StoredSession) -> SessionResult<AuthState> {
        let profile = self.resolve(&session).await?;
        let hosted = session.kind == SessionKind::Hosted;
        if let Err(err) = check_path(&profile, hosted) {
            warn!(role = profile.role.as_str(), active = profile.is_active, "session refused");
            if let Some(token) = session.access_token.as_deref().filter(|_| hosted) {
                if let Err(remote) = self.auth.sign_out(token).await {
                    warn!(?remote, "remote sign-out failed");
                }
            }
            self.clear_local().await?;
            return Err(err);
        }
        let state = AuthState { session, profile };
        *self.state.write().await = Some(state.clone());
        Ok(state)
    }

    async fn clear_local(&self) -> SessionResult<()> {
        self.auth.set_access_token(None);
        db::clear_session(&self.pool).await?;
        self.lock_inflight().clear();
        *self.state.write().await = None;
        Ok(())
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, Inflight>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn resolve(&self, session: &StoredSession) -> SessionResult<UserProfile> {
        let cell = {
            let mut inflight = self.lock_inflight();
            inflight.retain(|id, _| id == &session.session_id);
            inflight
                .entry(session.session_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let profile = cell
            .get_or_try_init(|| self.load_profile(session.user_id))
            .await?;
        Ok(profile.clone())
    }

    async fn load_profile(&self, user_id: Uuid) -> SessionResult<UserProfile> {
        let cached = db::get_profile(&self.pool, user_id).await?;
        if let Some(CachedProfile { profile, .. }) = cached
            .as_ref()
            .filter(|c| c.is_fresh(Utc::now(), self.profile_ttl))
        {
            debug!(%user_id, "profile served from cache");
            return Ok(profile.clone());
        }

        let fetched = self
            .gateway
            .backend()
            .select("users", &Query::new().eq("id", user_id).limit(1))
            .await;
        match fetched {
            Ok(rows) => {
                let row = rows.into_iter().next().ok_or(SessionError::NoProfile(user_id))?;
                let profile: UserProfile =
                    serde_json::from_value(row).map_err(BackendError::from)?;
                db::put_profile(&self.pool, &profile, Utc::now()).await?;
                debug!(%user_id, "profile fetched");
                Ok(profile)
            }
            Err(err) => match cached {
                Some(stale) => {
                    warn!(?err, %user_id, "profile fetch failed; using stale copy");
                    Ok(stale.profile)
                }
                None => Err(err.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_profile_shapes() {
        let row = json!({
            "id": Uuid::new_v4(),
            "full_name": "Fatou Sow",
            "role": "teacher",
            "created_at": "2024-09-01T08:00:00Z"
        });
        assert!(profile_from_rpc(row.clone()).unwrap().is_some());
        assert!(profile_from_rpc(json!([row])).unwrap().is_some());
        assert!(profile_from_rpc(json!([])).unwrap().is_none());
        assert!(profile_from_rpc(Value::Null).unwrap().is_none());
    }
}
