use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{ensure_same_school, first_row, require_role, ServiceError, ServiceResult};
use crate::gateway::ApiGateway;
use crate::model::{Role, School, UserProfile};
use crate::services::decode_rows;
use crate::supabase::Query;

const TABLE: &str = "schools";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSchool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchoolPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<Uuid>,
}

#[instrument(skip_all)]
pub async fn list(gw: &ApiGateway, caller: &UserProfile) -> ServiceResult<Vec<School>> {
    let query = match caller.role {
        Role::Admin => Query::new(),
        _ => {
            let id = caller
                .school_id
                .ok_or(ServiceError::Forbidden("caller is not attached to a school"))?;
            Query::new().eq("id", id)
        }
    }
    .order("name", true);
    let res = gw.query(TABLE, &query).await?;
    Ok(decode_rows(&res.data)?)
}

#[instrument(skip_all)]
pub async fn get(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<School> {
    ensure_same_school(caller, id)?;
    let res = gw.query(TABLE, &Query::new().eq("id", id).limit(1)).await?;
    first_row(&res.data, "school", id)
}

#[instrument(skip_all)]
pub async fn create(gw: &ApiGateway, caller: &UserProfile, school: &NewSchool) -> ServiceResult<School> {
    require_role(caller, &[Role::Admin])?;
    if school.name.trim().is_empty() {
        return Err(ServiceError::Invalid("school name is required".into()));
    }
    let mut body = serde_json::to_value(school)?;
    body["is_active"] = json!(true);
    let rows = gw.insert(TABLE, body).await?;
    let created: School = first_row(&rows, "school", Uuid::nil())?;
    info!(school_id = %created.id, "school created");
    Ok(created)
}

#[instrument(skip_all)]
pub async fn update(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    patch: &SchoolPatch,
) -> ServiceResult<School> {
    require_role(caller, &[Role::Admin, Role::Principal])?;
    ensure_same_school(caller, id)?;
    if patch.principal_id.is_some() && caller.role != Role::Admin {
        return Err(ServiceError::Forbidden("only admins can reassign principals"));
    }
    let rows = gw
        .update(TABLE, &Query::new().eq("id", id), serde_json::to_value(patch)?)
        .await?;
    first_row(&rows, "school", id)
}

#[instrument(skip_all)]
pub async fn set_active(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    active: bool,
) -> ServiceResult<School> {
    require_role(caller, &[Role::Admin])?;
    let rows = gw
        .update(TABLE, &Query::new().eq("id", id), json!({ "is_active": active }))
        .await?;
    first_row(&rows, "school", id)
}
