use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use super::{first_row, require_role, users, ServiceError, ServiceResult};
use crate::gateway::ApiGateway;
use crate::model::{Notification, Role, UserProfile};
use crate::services::decode_rows;
use crate::supabase::Query;

const TABLE: &str = "notifications";

fn own(caller: &UserProfile, user_id: Uuid) -> ServiceResult<()> {
    if caller.id == user_id || caller.role == Role::Admin {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("notifications belong to another user"))
    }
}

/// Most recent first. Bypasses the cache; the realtime feed makes cached
/// copies stale immediately.
#[instrument(skip_all)]
pub async fn list(
    gw: &ApiGateway,
    caller: &UserProfile,
    user_id: Uuid,
    limit: usize,
) -> ServiceResult<Vec<Notification>> {
    own(caller, user_id)?;
    let query = Query::new()
        .eq("user_id", user_id)
        .order("created_at", false)
        .limit(limit);
    let rows = gw.backend().select(TABLE, &query).await?;
    Ok(decode_rows(&rows)?)
}

#[instrument(skip_all)]
pub async fn unread_count(gw: &ApiGateway, caller: &UserProfile, user_id: Uuid) -> ServiceResult<usize> {
    own(caller, user_id)?;
    let query = Query::new()
        .select("id")
        .eq("user_id", user_id)
        .eq("is_read", false);
    Ok(gw.backend().select(TABLE, &query).await?.len())
}

#[instrument(skip_all)]
pub async fn mark_read(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<Notification> {
    let rows = gw
        .update(
            TABLE,
            &Query::new().eq("id", id).eq("user_id", caller.id),
            json!({ "is_read": true }),
        )
        .await?;
    first_row(&rows, "notification", id)
}

/// Returns how many notifications were flipped.
#[instrument(skip_all)]
pub async fn mark_all_read(gw: &ApiGateway, caller: &UserProfile) -> ServiceResult<usize> {
    let rows = gw
        .update(
            TABLE,
            &Query::new().eq("user_id", caller.id).eq("is_read", false),
            json!({ "is_read": true }),
        )
        .await?;
    Ok(rows.len())
}

#[instrument(skip_all)]
pub async fn create(
    gw: &ApiGateway,
    caller: &UserProfile,
    user_id: Uuid,
    title: &str,
    message: &str,
    kind: &str,
    link: Option<&str>,
) -> ServiceResult<Notification> {
    require_role(caller, &[Role::Admin, Role::Principal, Role::Secretary])?;
    if title.trim().is_empty() {
        return Err(ServiceError::Invalid("notification title is required".into()));
    }
    // Recipient must be visible to the caller.
    users::get(gw, caller, user_id).await?;
    let rows = gw
        .insert(
            TABLE,
            json!({
                "user_id": user_id,
                "title": title,
                "message": message,
                "kind": kind,
                "link": link,
                "is_read": false,
            }),
        )
        .await?;
    first_row(&rows, "notification", user_id)
}
