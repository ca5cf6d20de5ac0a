use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{ensure_same_school, first_row, require_role, school_scope, ServiceError, ServiceResult};
use crate::accounts::{self, AccountPolicy, StudentCreated, StudentForm};
use crate::gateway::ApiGateway;
use crate::model::{EnrollmentRequest, EnrollmentStatus, Role, UserProfile};
use crate::services::decode_rows;
use crate::supabase::Query;

const TABLE: &str = "enrollment_requests";
const PROCESSORS: &[Role] = &[Role::Admin, Role::Principal, Role::Secretary];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEnrollment {
    pub school_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<Uuid>,
    pub student_first_name: String,
    pub student_last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Approved {
    pub request: EnrollmentRequest,
    pub student: StudentCreated,
}

#[instrument(skip_all)]
pub async fn list(
    gw: &ApiGateway,
    caller: &UserProfile,
    status: Option<EnrollmentStatus>,
) -> ServiceResult<Vec<EnrollmentRequest>> {
    require_role(caller, PROCESSORS)?;
    let mut query = school_scope(caller, Query::new(), "school_id")?;
    if let Some(status) = status {
        query = query.eq("status", status.as_str());
    }
    let res = gw.query(TABLE, &query.order("created_at", false)).await?;
    Ok(decode_rows(&res.data)?)
}

#[instrument(skip_all)]
pub async fn submit(gw: &ApiGateway, request: &NewEnrollment) -> ServiceResult<EnrollmentRequest> {
    if request.student_first_name.trim().is_empty() || request.student_last_name.trim().is_empty() {
        return Err(ServiceError::Invalid("student name is required".into()));
    }
    if let Some(email) = request.parent_email.as_deref().filter(|e| !e.trim().is_empty()) {
        if !accounts::is_valid_email(email) {
            return Err(ServiceError::Invalid(format!(
                "invalid parent email address: {}",
                email
            )));
        }
    }
    let mut row = serde_json::to_value(request)?;
    row["status"] = json!(EnrollmentStatus::Pending.as_str());
    let rows = gw.insert(TABLE, row).await?;
    let created: EnrollmentRequest = first_row(&rows, "enrollment request", Uuid::nil())?;
    info!(request_id = %created.id, "enrollment request submitted");
    Ok(created)
}

async fn pending(gw: &ApiGateway, caller: &UserProfile, id: Uuid) -> ServiceResult<EnrollmentRequest> {
    require_role(caller, PROCESSORS)?;
    // Uncached: another operator may have processed it since the last list.
    let rows = gw
        .backend()
        .select(TABLE, &Query::new().eq("id", id).limit(1))
        .await?;
    let request: EnrollmentRequest = first_row(&rows, "enrollment request", id)?;
    ensure_same_school(caller, request.school_id)?;
    if request.status != EnrollmentStatus::Pending {
        return Err(ServiceError::Invalid(format!(
            "request already {}",
            request.status.as_str()
        )));
    }
    Ok(request)
}

/// Moves a pending request to `status`. Empty when another operator got
/// there first.
async fn claim(gw: &ApiGateway, id: Uuid, patch: serde_json::Value) -> ServiceResult<EnrollmentRequest> {
    let rows = gw
        .update(
            TABLE,
            &Query::new()
                .eq("id", id)
                .eq("status", EnrollmentStatus::Pending.as_str()),
            patch,
        )
        .await?;
    decode_rows::<EnrollmentRequest>(&rows)?
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::Invalid("request already processed".into()))
}

/// Claims the request as approved, then creates the student account. The
/// claim is rolled back if the account cannot be created.
#[instrument(skip_all, fields(request_id = %id))]
pub async fn approve(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    class_id: Option<Uuid>,
    policy: &AccountPolicy,
) -> ServiceResult<Approved> {
    let request = pending(gw, caller, id).await?;
    let class_id = class_id.or(request.class_id);
    let form = StudentForm {
        first_name: request.student_first_name.clone(),
        last_name: request.student_last_name.clone(),
        school_id: request.school_id,
        class_id,
        parent_email: request.parent_email.clone(),
        parent_phone: request.parent_phone.clone(),
    };
    accounts::validate_student_form(caller, &form)?;

    let request = claim(
        gw,
        id,
        json!({
            "status": EnrollmentStatus::Approved.as_str(),
            "class_id": class_id,
            "processed_at": Utc::now(),
        }),
    )
    .await?;
    let student = match accounts::create_student(gw, caller, &form, policy).await {
        Ok(student) => student,
        Err(err) => {
            warn!(?err, "student creation failed; releasing request");
            let released = gw
                .update(
                    TABLE,
                    &Query::new()
                        .eq("id", id)
                        .eq("status", EnrollmentStatus::Approved.as_str()),
                    json!({
                        "status": EnrollmentStatus::Pending.as_str(),
                        "processed_at": null,
                    }),
                )
                .await;
            if let Err(release_err) = released {
                warn!(?release_err, "could not release enrollment request");
            }
            return Err(err);
        }
    };
    info!(student_id = %student.profile.id, "enrollment approved");
    Ok(Approved { request, student })
}

#[instrument(skip_all, fields(request_id = %id))]
pub async fn reject(
    gw: &ApiGateway,
    caller: &UserProfile,
    id: Uuid,
    reason: Option<&str>,
) -> ServiceResult<EnrollmentRequest> {
    let request = pending(gw, caller, id).await?;
    let notes = match (request.notes.as_deref(), reason.map(str::trim)) {
        (_, None) | (_, Some("")) => request.notes.clone(),
        (Some(prev), Some(reason)) if !prev.is_empty() => Some(format!("{}\n{}", prev, reason)),
        (_, Some(reason)) => Some(reason.to_string()),
    };
    let rejected = claim(
        gw,
        id,
        json!({
            "status": EnrollmentStatus::Rejected.as_str(),
            "notes": notes,
            "processed_at": Utc::now(),
        }),
    )
    .await?;
    info!("enrollment rejected");
    Ok(rejected)
}
