use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{ensure_same_school, first_row, require_role, school_scope, ServiceError, ServiceResult};
use crate::gateway::ApiGateway;
use crate::model::{Class, Role, UserProfile};
use crate::services::decode_rows;
use crate::supabase::Query;

const TABLE: &str = "classes";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewClass {
    pub school_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i32>,
}

const MANAGERS: &[Role] = &[Role::Admin, Role::Principal, Role::Secretary];

#[instrument(skip_all)]
pub async fn list(gw: &ApiGateway, caller: &UserProfile) -> ServiceResult<Vec<Class>> {
    let mut query = school_scope(caller, Query::new(), "school_id")?;
    if caller.role == Role::Teacher {
        query = query.eq("teacher_id", caller.id);
    }
    let res = gw.query(TABLE, &query.order("name", true)).await?;
    Ok(decode_rows(&res.data)?)
}

async fn get(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<Class> {
    let res = gw.query(TABLE, &Query::new().eq("id", id).limit(1)).await?;
    let class: Class = first_row(&res.data, "class", id)?;
    ensure_same_school(caller, class.school_id)?;
    Ok(class)
}

#[instrument(skip_all)]
pub async fn create(gw: &ApiGateway, caller: &UserProfile, class: &NewClass) -> ServiceResult<Class> {
    require_role(caller, MANAGERS)?;
    ensure_same_school(caller, class.school_id)?;
    if class.name.trim().is_empty() {
        return Err(ServiceError::Invalid("class name is required".into()));
    }
    if matches!(class.capacity, Some(c) if c <= 0) {
        return Err(ServiceError::Invalid("capacity must be positive".into()));
    }
    let rows = gw.insert(TABLE, serde_json::to_value(class)?).await?;
    let created: Class = first_row(&rows, "class", Uuid::nil())?;
    info!(class_id = %created.id, "class created");
    Ok(created)
}

#[instrument(skip_all)]
pub async fn update(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    patch: &ClassPatch,
) -> ServiceResult<Class> {
    require_role(caller, MANAGERS)?;
    get(gw, caller, id).await?;
    let rows = gw
        .update(TABLE, &Query::new().eq("id", id), serde_json::to_value(patch)?)
        .await?;
    first_row(&rows, "class", id)
}

#[instrument(skip_all)]
pub async fn delete(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<()> {
    require_role(caller, &[Role::Admin, Role::Principal])?;
    get(gw, caller, id).await?;
    gw.delete(TABLE, &Query::new().eq("id", id)).await?;
    info!(class_id = %id, "class deleted");
    Ok(())
}

#[instrument(skip_all)]
pub async fn assign_teacher(
    gw: &ApiGateway,
    caller: &UserProfile,
    class_id: Uuid,
    teacher_id: Option<Uuid>,
) -> ServiceResult<Class> {
    require_role(caller, MANAGERS)?;
    let class = get(gw, caller, class_id).await?;
    if let Some(teacher_id) = teacher_id {
        let res = gw
            .query("users", &Query::new().eq("id", teacher_id).limit(1))
            .await?;
        let teacher: UserProfile = first_row(&res.data, "user", teacher_id)?;
        if teacher.role != Role::Teacher {
            return Err(ServiceError::Invalid("assigned user is not a teacher".into()));
        }
        if teacher.school_id != Some(class.school_id) {
            return Err(ServiceError::Invalid(
                "teacher belongs to another school".into(),
            ));
        }
    }
    let rows = gw
        .update(
            TABLE,
            &Query::new().eq("id", class_id),
            json!({ "teacher_id": teacher_id }),
        )
        .await?;
    first_row(&rows, "class", class_id)
}
