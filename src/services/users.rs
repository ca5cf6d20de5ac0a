use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{ensure_same_school, first_row, require_role, school_scope, ServiceError, ServiceResult};
use crate::gateway::ApiGateway;
use crate::model::{Role, UserProfile};
use crate::services::decode_rows;
use crate::supabase::{Filter, Query};

const TABLE: &str = "users";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub class_id: Option<Uuid>,
    pub search: Option<String>,
    pub active_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<Uuid>,
}

impl UserFilter {
    fn apply(&self, mut query: Query) -> Query {
        if let Some(role) = self.role {
            query = query.eq("role", role.as_str());
        }
        if let Some(class_id) = self.class_id {
            query = query.eq("class_id", class_id);
        }
        if self.active_only {
            query = query.eq("is_active", true);
        }
        if let Some(term) = self.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            // PostgREST reserves commas and parentheses inside `or=(...)`.
            let term: String = term
                .chars()
                .filter(|c| !matches!(c, ',' | '(' | ')'))
                .collect();
            let pattern = format!("*{}*", term);
            query = query.or(vec![
                Filter::Ilike {
                    column: "full_name".into(),
                    pattern: pattern.clone(),
                },
                Filter::Ilike {
                    column: "email".into(),
                    pattern,
                },
            ]);
        }
        query
    }
}

#[instrument(skip_all)]
pub async fn list(
    gw: &ApiGateway,
    caller: &UserProfile,
    filter: &UserFilter,
) -> ServiceResult<Vec<UserProfile>> {
    require_role(caller, &[Role::Admin, Role::Principal, Role::Secretary, Role::Teacher])?;
    let query = school_scope(caller, Query::new(), "school_id")?;
    let query = filter.apply(query).order("full_name", true);
    let res = gw.query(TABLE, &query).await?;
    Ok(decode_rows(&res.data)?)
}

#[instrument(skip_all)]
pub async fn get(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<UserProfile> {
    let res = gw.query(TABLE, &Query::new().eq("id", id).limit(1)).await?;
    let user: UserProfile = first_row(&res.data, "user", id)?;
    if user.id != caller.id {
        match user.school_id {
            Some(school) => ensure_same_school(caller, school)?,
            None => require_role(caller, &[Role::Admin])?,
        }
    }
    Ok(user)
}

/// Whether `caller` may manage an account holding `target` role.
pub(crate) fn can_manage(caller: &UserProfile, target: Role) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::Principal => !matches!(target, Role::Admin | Role::Principal),
        Role::Secretary => matches!(target, Role::Student | Role::Parent),
        _ => false,
    }
}

#[instrument(skip_all)]
pub async fn update(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    patch: &UserPatch,
) -> ServiceResult<UserProfile> {
    let target = get(gw, caller, id).await?;
    let manages = can_manage(caller, target.role);
    if target.id != caller.id && !manages {
        return Err(ServiceError::Forbidden("cannot edit this account"));
    }
    let mut body = serde_json::to_value(patch)?;
    if !manages {
        // Self-edits cover personal details only.
        if let Some(fields) = body.as_object_mut() {
            if fields.remove("class_id").is_some() {
                warn!(user_id = %id, "ignoring class change on own account");
            }
            if fields.is_empty() {
                return Ok(target);
            }
        }
    }
    let rows = gw.update(TABLE, &Query::new().eq("id", id), body).await?;
    first_row(&rows, "user", id)
}

#[instrument(skip_all)]
pub async fn set_active(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    active: bool,
) -> ServiceResult<UserProfile> {
    let target = get(gw, caller, id).await?;
    if target.id == caller.id {
        return Err(ServiceError::Invalid("cannot change your own status".into()));
    }
    if !can_manage(caller, target.role) {
        return Err(ServiceError::Forbidden("cannot change this account"));
    }
    let rows = gw
        .update(TABLE, &Query::new().eq("id", id), json!({ "is_active": active }))
        .await?;
    info!(user_id = %id, active, "user status changed");
    first_row(&rows, "user", id)
}

#[instrument(skip_all)]
pub async fn delete(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<()> {
    require_role(caller, &[Role::Admin, Role::Principal])?;
    let target = get(gw, caller, id).await?;
    if target.id == caller.id {
        return Err(ServiceError::Invalid("cannot delete your own account".into()));
    }
    if !can_manage(caller, target.role) {
        return Err(ServiceError::Forbidden("cannot delete this account"));
    }
    gw.delete(TABLE, &Query::new().eq("id", id)).await?;
    info!(user_id = %id, "user deleted");
    Ok(())
}
