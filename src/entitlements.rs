//! Per-school application entitlements.
//!
//! Core apps are always accessible. Everything else needs a `trial` or
//! `active` subscription row whose end date is still in the future.
//! Subscription rows are read straight from the backend on every check, so
//! the trial and activation RPCs leave nothing cached to invalidate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::gateway::ApiGateway;
use crate::model::{App, AppAccessRequest, SchoolSubscription, SubscriptionStatus};
use crate::services::decode_rows;
use crate::supabase::{BackendError, Query};

const MS_PER_DAY: i64 = 86_400_000;

/// Identifies an app by primary key or by slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppRef {
    Id(Uuid),
    Slug(String),
}

impl From<&str> for AppRef {
    fn from(s: &str) -> Self {
        match Uuid::parse_str(s) {
            Ok(id) => AppRef::Id(id),
            Err(_) => AppRef::Slug(s.to_string()),
        }
    }
}

impl From<Uuid> for AppRef {
    fn from(id: Uuid) -> Self {
        AppRef::Id(id)
    }
}

impl AppRef {
    fn matches(&self, app: &App) -> bool {
        match self {
            AppRef::Id(id) => app.id == *id,
            AppRef::Slug(slug) => app.slug == *slug,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppAccess {
    pub app_id: Option<Uuid>,
    pub has_access: bool,
    pub is_core: bool,
    pub status: Option<SubscriptionStatus>,
    pub days_remaining: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AppAccess {
    fn failed(err: impl ToString) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureAccess {
    pub has_access: bool,
    pub feature_enabled: bool,
    pub credits_remaining: Option<i64>,
    pub app: AppAccess,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveApp {
    pub app: App,
    pub access: AppAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionView {
    pub subscription: SchoolSubscription,
    pub app_name: Option<String>,
    pub is_valid: bool,
    pub days_remaining: Option<i64>,
}

/// Whole days left until `expiry`, rounded up, never negative.
pub fn days_remaining(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let ms = (expiry - now).num_milliseconds();
    if ms <= 0 {
        0
    } else {
        (ms + MS_PER_DAY - 1) / MS_PER_DAY
    }
}

/// Decide access for one app given the tenant's current subscription row.
pub fn evaluate_access(
    app: &App,
    subscription: Option<&SchoolSubscription>,
    now: DateTime<Utc>,
) -> AppAccess {
    if app.is_core {
        return AppAccess {
            app_id: Some(app.id),
            has_access: true,
            is_core: true,
            ..Default::default()
        };
    }
    let Some(sub) = subscription else {
        return AppAccess {
            app_id: Some(app.id),
            ..Default::default()
        };
    };

    let expiry = match sub.status {
        SubscriptionStatus::Trial => sub.trial_ends_at,
        SubscriptionStatus::Active => sub.expires_at,
        SubscriptionStatus::Expired | SubscriptionStatus::Cancelled => {
            return AppAccess {
                app_id: Some(app.id),
                status: Some(sub.status),
                days_remaining: Some(0),
                expires_at: sub.expires_at.or(sub.trial_ends_at),
                ..Default::default()
            }
        }
    };

    let has_access = match (sub.status, expiry) {
        (_, Some(end)) => now < end,
        // An active row without an end date is open-ended; a trial must end.
        (SubscriptionStatus::Active, None) => true,
        _ => false,
    };
    AppAccess {
        app_id: Some(app.id),
        has_access,
        is_core: false,
        status: Some(sub.status),
        days_remaining: expiry.map(|end| days_remaining(end, now)),
        expires_at: expiry,
        error: None,
    }
}

/// Combine app access with the feature list and the usage-credit counter.
pub fn evaluate_feature(
    app: &App,
    access: AppAccess,
    subscription: Option<&SchoolSubscription>,
    feature: &str,
) -> FeatureAccess {
    let feature_enabled = app.features.iter().any(|f| f == feature);
    let credits_remaining = subscription.and_then(|s| {
        s.credits_total
            .map(|total| (total - s.credits_used.unwrap_or(0)).max(0))
    });
    let has_credits = credits_remaining.map(|r| r > 0).unwrap_or(true);
    FeatureAccess {
        has_access: access.has_access && feature_enabled && has_credits,
        feature_enabled,
        credits_remaining,
        error: access.error.clone(),
        app: access,
    }
}

#[derive(Clone)]
pub struct EntitlementService {
    gateway: ApiGateway,
}

impl EntitlementService {
    pub fn new(gateway: ApiGateway) -> Self {
        Self { gateway }
    }

    async fn catalog(&self) -> Result<Vec<App>, BackendError> {
        let res = self
            .gateway
            .query("apps", &Query::new().order("name", true))
            .await?;
        decode_rows(&res.data)
    }

    async fn find_app(&self, app: &AppRef) -> Result<Option<App>, BackendError> {
        Ok(self.catalog().await?.into_iter().find(|a| app.matches(a)))
    }

    /// Subscriptions are always read fresh so that watchers observe changes.
    async fn current_subscription(
        &self,
        school_id: Uuid,
        app_id: Uuid,
    ) -> Result<Option<SchoolSubscription>, BackendError> {
        let query = Query::new()
            .eq("school_id", school_id)
            .eq("app_id", app_id)
            .in_(
                "status",
                [
                    SubscriptionStatus::Trial.as_str(),
                    SubscriptionStatus::Active.as_str(),
                ],
            )
            .order("created_at", false)
            .limit(1);
        let rows = self
            .gateway
            .backend()
            .select("school_subscriptions", &query)
            .await?;
        Ok(decode_rows::<SchoolSubscription>(&rows)?.into_iter().next())
    }

    async fn live_subscriptions(
        &self,
        school_id: Uuid,
    ) -> Result<Vec<SchoolSubscription>, BackendError> {
        let query = Query::new()
            .eq("school_id", school_id)
            .order("created_at", false);
        let rows = self
            .gateway
            .backend()
            .select("school_subscriptions", &query)
            .await?;
        decode_rows(&rows)
    }

    #[instrument(skip(self))]
    pub async fn check_app_access(&self, school_id: Uuid, app: &AppRef) -> AppAccess {
        match self.try_app_access(school_id, app).await {
            Ok((access, _, _)) => access,
            Err(err) => {
                warn!(?err, "app access check failed");
                AppAccess::failed(err)
            }
        }
    }

    async fn try_app_access(
        &self,
        school_id: Uuid,
        app: &AppRef,
    ) -> Result<(AppAccess, Option<App>, Option<SchoolSubscription>), BackendError> {
        let Some(found) = self.find_app(app).await? else {
            debug!(?app, "app not in catalog");
            return Ok((AppAccess::default(), None, None));
        };
        if found.is_core {
            let access = evaluate_access(&found, None, Utc::now());
            return Ok((access, Some(found), None));
        }
        let sub = self.current_subscription(school_id, found.id).await?;
        let access = evaluate_access(&found, sub.as_ref(), Utc::now());
        Ok((access, Some(found), sub))
    }

    #[instrument(skip(self))]
    pub async fn check_feature_access(
        &self,
        school_id: Uuid,
        app: &AppRef,
        feature: &str,
    ) -> FeatureAccess {
        match self.try_app_access(school_id, app).await {
            Ok((access, Some(found), sub)) => evaluate_feature(&found, access, sub.as_ref(), feature),
            Ok((access, None, _)) => FeatureAccess {
                app: access,
                ..Default::default()
            },
            Err(err) => {
                warn!(?err, "feature access check failed");
                FeatureAccess {
                    error: Some(err.to_string()),
                    app: AppAccess::failed(&err),
                    ..Default::default()
                }
            }
        }
    }

    /// Core apps plus every app with a currently valid subscription.
    pub async fn active_apps(&self, school_id: Uuid) -> Result<Vec<ActiveApp>, BackendError> {
        let apps = self.catalog().await?;
        let subs = self.live_subscriptions(school_id).await?;
        let now = Utc::now();
        let active = apps
            .into_iter()
            .filter_map(|app| {
                let sub = subs.iter().find(|s| {
                    s.app_id == app.id
                        && matches!(
                            s.status,
                            SubscriptionStatus::Trial | SubscriptionStatus::Active
                        )
                });
                let access = evaluate_access(&app, sub, now);
                access.has_access.then_some(ActiveApp { app, access })
            })
            .collect();
        Ok(active)
    }

    pub async fn school_subscriptions(
        &self,
        school_id: Uuid,
    ) -> Result<Vec<SubscriptionView>, BackendError> {
        let apps = self.catalog().await?;
        let subs = self.live_subscriptions(school_id).await?;
        let now = Utc::now();
        Ok(subs
            .into_iter()
            .map(|sub| {
                let app = apps.iter().find(|a| a.id == sub.app_id);
                let access = app.map(|a| evaluate_access(a, Some(&sub), now));
                SubscriptionView {
                    app_name: app.map(|a| a.name.clone()),
                    is_valid: access.as_ref().map(|a| a.has_access).unwrap_or(false),
                    days_remaining: access.and_then(|a| a.days_remaining),
                    subscription: sub,
                }
            })
            .collect())
    }

    pub async fn start_trial(&self, school_id: Uuid, app_id: Uuid) -> Result<(), BackendError> {
        self.gateway
            .rpc(
                "start_trial",
                json!({ "p_school_id": school_id, "p_app_id": app_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn activate_subscription(
        &self,
        school_id: Uuid,
        app_id: Uuid,
        months: u32,
    ) -> Result<(), BackendError> {
        self.gateway
            .rpc(
                "activate_subscription",
                json!({ "p_school_id": school_id, "p_app_id": app_id, "p_months": months }),
            )
            .await?;
        Ok(())
    }

    pub async fn request_app_access(
        &self,
        school_id: Uuid,
        app_id: Uuid,
        requested_by: Uuid,
        message: Option<&str>,
    ) -> Result<AppAccessRequest, BackendError> {
        let rows = self
            .gateway
            .insert(
                "app_access_requests",
                json!({
                    "school_id": school_id,
                    "app_id": app_id,
                    "requested_by": requested_by,
                    "status": "pending",
                    "message": message,
                }),
            )
            .await?;
        decode_rows::<AppAccessRequest>(&rows)?
            .into_iter()
            .next()
            .ok_or(BackendError::NotFound)
    }

    /// Poll access every `interval` until the returned handle is dropped.
    pub fn watch_app_access(&self, school_id: Uuid, app: AppRef, interval: Duration) -> AccessWatcher {
        let (tx, rx) = watch::channel(AppAccess::default());
        let refresh = Arc::new(Notify::new());
        let service = self.clone();
        let wake = Arc::clone(&refresh);
        let task = tokio::spawn(async move {
            loop {
                let access = service.check_app_access(school_id, &app).await;
                if tx.send(access).is_err() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wake.notified() => {}
                }
            }
        });
        AccessWatcher { rx, refresh, task }
    }
}

/// Live view of one app's access; stops polling on drop.
pub struct AccessWatcher {
    rx: watch::Receiver<AppAccess>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl AccessWatcher {
    pub fn current(&self) -> AppAccess {
        self.rx.borrow().clone()
    }

    /// Wait for the next published check.
    pub async fn changed(&mut self) -> Option<AppAccess> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Re-check immediately instead of waiting for the interval.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }
}

impl Drop for AccessWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn app(is_core: bool) -> App {
        App {
            id: Uuid::new_v4(),
            name: "Gradebook".into(),
            slug: "gradebook".into(),
            description: None,
            is_core,
            features: vec!["report_cards".into(), "sms".into()],
            price: None,
            trial_days: Some(14),
        }
    }

    fn sub(app: &App, status: SubscriptionStatus) -> SchoolSubscription {
        SchoolSubscription {
            id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
            app_id: app.id,
            status,
            trial_ends_at: None,
            expires_at: None,
            credits_used: None,
            credits_total: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn core_app_ignores_subscription_state() {
        let a = app(true);
        let mut s = sub(&a, SubscriptionStatus::Expired);
        s.expires_at = Some(Utc::now() - ChronoDuration::days(30));
        let access = evaluate_access(&a, Some(&s), Utc::now());
        assert!(access.has_access);
        assert!(access.is_core);
        assert!(evaluate_access(&a, None, Utc::now()).has_access);
    }

    #[test]
    fn expired_trial_denies_access() {
        let a = app(false);
        let now = Utc::now();
        let mut s = sub(&a, SubscriptionStatus::Trial);
        s.trial_ends_at = Some(now - ChronoDuration::hours(1));
        let access = evaluate_access(&a, Some(&s), now);
        assert!(!access.has_access);
        assert_eq!(access.days_remaining, Some(0));
    }

    #[test]
    fn active_one_day_left() {
        let a = app(false);
        let now = Utc::now();
        let mut s = sub(&a, SubscriptionStatus::Active);
        s.expires_at = Some(now + ChronoDuration::days(1));
        let access = evaluate_access(&a, Some(&s), now);
        assert!(access.has_access);
        assert_eq!(access.days_remaining, Some(1));
    }

    #[test]
    fn days_remaining_rounds_up() {
        let now = Utc::now();
        assert_eq!(days_remaining(now + ChronoDuration::hours(1), now), 1);
        assert_eq!(days_remaining(now + ChronoDuration::hours(25), now), 2);
        assert_eq!(days_remaining(now - ChronoDuration::hours(25), now), 0);
        assert_eq!(days_remaining(now, now), 0);
    }

    #[test]
    fn open_ended_active_and_trial_without_end() {
        let a = app(false);
        let s = sub(&a, SubscriptionStatus::Active);
        let access = evaluate_access(&a, Some(&s), Utc::now());
        assert!(access.has_access);
        assert_eq!(access.days_remaining, None);

        let s = sub(&a, SubscriptionStatus::Trial);
        assert!(!evaluate_access(&a, Some(&s), Utc::now()).has_access);
    }

    #[test]
    fn feature_access_checks_list_and_credits() {
        let a = app(false);
        let now = Utc::now();
        let mut s = sub(&a, SubscriptionStatus::Active);
        s.expires_at = Some(now + ChronoDuration::days(10));
        s.credits_total = Some(100);
        s.credits_used = Some(40);

        let access = evaluate_access(&a, Some(&s), now);
        let f = evaluate_feature(&a, access.clone(), Some(&s), "sms");
        assert!(f.has_access);
        assert_eq!(f.credits_remaining, Some(60));

        let f = evaluate_feature(&a, access.clone(), Some(&s), "timetable");
        assert!(!f.feature_enabled);
        assert!(!f.has_access);

        s.credits_used = Some(100);
        let f = evaluate_feature(&a, access, Some(&s), "sms");
        assert!(!f.has_access);
        assert_eq!(f.credits_remaining, Some(0));
    }

    #[test]
    fn app_ref_parses_uuid_or_slug() {
        let id = Uuid::new_v4();
        assert_eq!(AppRef::from(id.to_string().as_str()), AppRef::Id(id));
        assert_eq!(AppRef::from("gradebook"), AppRef::Slug("gradebook".into()));
    }
}
