//! Account creation flows: staff through the `create-staff-account`
//! function, students through a direct table write with a hashed PIN.

use bcrypt::DEFAULT_COST;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::credentials::{self, DEFAULT_PIN_LENGTH};
use crate::gateway::ApiGateway;
use crate::model::{Role, UserProfile};
use crate::services::users::{self, can_manage};
use crate::services::{ensure_same_school, first_row, require_role, ServiceError, ServiceResult};
use crate::supabase::{BackendError, Query};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

const GENERATED_PASSWORD_LENGTH: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountPolicy {
    pub pin_length: usize,
    pub hash_cost: u32,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            pin_length: DEFAULT_PIN_LENGTH,
            hash_cost: DEFAULT_COST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffAccountForm {
    pub email: String,
    /// Generated when absent.
    pub password: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub school_id: Uuid,
    pub class_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffAccountCreated {
    pub user_id: Uuid,
    /// Shown to the operator once.
    pub password: String,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StaffAccountPayload<'a> {
    email: &'a str,
    password: &'a str,
    full_name: String,
    phone: Option<&'a str>,
    role: Role,
    school_id: Uuid,
    created_by_user_id: Uuid,
    first_name: &'a str,
    last_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    class_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaffAccountResponse {
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentForm {
    pub first_name: String,
    pub last_name: String,
    pub school_id: Uuid,
    pub class_id: Option<Uuid>,
    pub parent_email: Option<String>,
    pub parent_phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentCreated {
    pub profile: UserProfile,
    /// Clear-text PIN; only the hash is stored.
    pub pin: String,
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

fn full_name(first: &str, last: &str) -> String {
    format!("{} {}", first.trim(), last.trim()).trim().to_string()
}

/// Form checks that do not need the backend.
pub fn validate_staff_form(caller: &UserProfile, form: &StaffAccountForm) -> ServiceResult<()> {
    if form.first_name.trim().is_empty() || form.last_name.trim().is_empty() {
        return Err(ServiceError::Invalid("first and last name are required".into()));
    }
    if !is_valid_email(&form.email) {
        return Err(ServiceError::Invalid(format!(
            "invalid email address: {}",
            form.email
        )));
    }
    if !matches!(form.role, Role::Teacher | Role::Secretary | Role::Principal) {
        return Err(ServiceError::Invalid(format!(
            "{} accounts are not staff accounts",
            form.role.as_str()
        )));
    }
    if form.class_id.is_some() && form.role != Role::Teacher {
        return Err(ServiceError::Invalid("only teachers can be assigned a class".into()));
    }
    if let Some(password) = &form.password {
        credentials::validate_password(password)?;
    }
    require_role(caller, &[Role::Admin, Role::Principal])?;
    ensure_same_school(caller, form.school_id)?;
    if !can_manage(caller, form.role) {
        return Err(ServiceError::Forbidden("cannot create this kind of account"));
    }
    Ok(())
}

#[instrument(skip_all, fields(role = form.role.as_str()))]
pub async fn create_staff_account(
    gw: &ApiGateway,
    function: &str,
    bearer: &str,
    caller: &UserProfile,
    form: &StaffAccountForm,
) -> ServiceResult<StaffAccountCreated> {
    validate_staff_form(caller, form)?;
    let password = match &form.password {
        Some(p) => p.clone(),
        None => credentials::generate_password(GENERATED_PASSWORD_LENGTH)?,
    };
    let payload = StaffAccountPayload {
        email: form.email.trim(),
        password: &password,
        full_name: full_name(&form.first_name, &form.last_name),
        phone: form.phone.as_deref(),
        role: form.role,
        school_id: form.school_id,
        created_by_user_id: caller.id,
        first_name: form.first_name.trim(),
        last_name: form.last_name.trim(),
        class_id: form.class_id,
    };

    let value = match gw
        .backend()
        .invoke_function(function, bearer, serde_json::to_value(&payload)?)
        .await
    {
        Ok(v) => v,
        Err(err) => {
            match &err {
                BackendError::AlreadyRegistered => warn!("staff email already registered"),
                BackendError::SubscriptionLimit(_) => warn!("school plan does not allow more staff"),
                BackendError::WeakPassword(_) => warn!("auth service rejected password"),
                _ => warn!(?err, "staff account creation failed"),
            }
            return Err(err.into());
        }
    };
    let response: StaffAccountResponse = serde_json::from_value(value)?;
    let user_id = match (response.success, response.user_id) {
        (Some(false), _) | (_, None) => {
            return Err(BackendError::Api {
                status: 200,
                code: "unexpected_response".into(),
                message: response
                    .message
                    .unwrap_or_else(|| "function returned no user id".into()),
            }
            .into())
        }
        (_, Some(id)) => id,
    };
    gw.invalidate("users");
    info!(%user_id, "staff account created");
    Ok(StaffAccountCreated {
        user_id,
        password,
        message: response.message,
    })
}

pub fn validate_student_form(caller: &UserProfile, form: &StudentForm) -> ServiceResult<()> {
    require_role(caller, &[Role::Admin, Role::Principal, Role::Secretary])?;
    ensure_same_school(caller, form.school_id)?;
    if form.first_name.trim().is_empty() || form.last_name.trim().is_empty() {
        return Err(ServiceError::Invalid("first and last name are required".into()));
    }
    if let Some(email) = form.parent_email.as_deref().filter(|e| !e.trim().is_empty()) {
        if !is_valid_email(email) {
            return Err(ServiceError::Invalid(format!(
                "invalid parent email address: {}",
                email
            )));
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_student(
    gw: &ApiGateway,
    caller: &UserProfile,
    form: &StudentForm,
    policy: &AccountPolicy,
) -> ServiceResult<StudentCreated> {
    validate_student_form(caller, form)?;
    let pin = credentials::generate_secure_pin(policy.pin_length)?;
    let pin_hash = credentials::hash_secret(&pin, Some(policy.hash_cost)).await?;
    let rows = gw
        .insert(
            "users",
            json!({
                "full_name": full_name(&form.first_name, &form.last_name),
                "first_name": form.first_name.trim(),
                "last_name": form.last_name.trim(),
                "role": Role::Student,
                "school_id": form.school_id,
                "class_id": form.class_id,
                "phone": form.parent_phone,
                "parent_email": form.parent_email,
                "is_active": true,
                "pin_hash": pin_hash,
            }),
        )
        .await?;
    let profile: UserProfile = first_row(&rows, "user", Uuid::nil())?;
    info!(user_id = %profile.id, "student created");
    Ok(StudentCreated { profile, pin })
}

/// Issue a new PIN for a PIN-based account; returns the clear PIN once.
#[instrument(skip_all)]
pub async fn reset_pin(
    gw: &ApiGateway,
    caller: &UserProfile,
    user_id: Uuid,
    policy: &AccountPolicy,
) -> ServiceResult<String> {
    let target = users::get(gw, caller, user_id).await?;
    if target.role.uses_hosted_auth() {
        return Err(ServiceError::Invalid(
            "this account signs in with a password".into(),
        ));
    }
    if !can_manage(caller, target.role) {
        return Err(ServiceError::Forbidden("cannot reset this PIN"));
    }
    let pin = credentials::generate_secure_pin(policy.pin_length)?;
    let pin_hash = credentials::hash_secret(&pin, Some(policy.hash_cost)).await?;
    gw.update(
        "users",
        &Query::new().eq("id", user_id),
        json!({ "pin_hash": pin_hash }),
    )
    .await?;
    info!(%user_id, "pin reset");
    Ok(pin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn principal(school: Uuid) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            email: Some("dir@ecole.sn".into()),
            full_name: "Directrice".into(),
            first_name: None,
            last_name: None,
            phone: None,
            role: Role::Principal,
            school_id: Some(school),
            class_id: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn form(school: Uuid) -> StaffAccountForm {
        StaffAccountForm {
            email: "prof@ecole.sn".into(),
            password: None,
            first_name: "Moussa".into(),
            last_name: "Fall".into(),
            phone: None,
            role: Role::Teacher,
            school_id: school,
            class_id: None,
        }
    }

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("a.b@ecole.sn"));
        assert!(is_valid_email(" a@b.co "));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.d"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn staff_form_rules() {
        let school = Uuid::new_v4();
        let caller = principal(school);
        assert!(validate_staff_form(&caller, &form(school)).is_ok());

        let mut f = form(school);
        f.role = Role::Principal;
        assert!(matches!(
            validate_staff_form(&caller, &f),
            Err(ServiceError::Forbidden(_))
        ));

        let mut f = form(school);
        f.role = Role::Student;
        assert!(matches!(
            validate_staff_form(&caller, &f),
            Err(ServiceError::Invalid(_))
        ));

        let mut f = form(school);
        f.password = Some("weak".into());
        assert!(matches!(
            validate_staff_form(&caller, &f),
            Err(ServiceError::Credential(_))
        ));

        assert!(matches!(
            validate_staff_form(&caller, &form(Uuid::new_v4())),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn payload_uses_camel_case() {
        let school = Uuid::new_v4();
        let caller = principal(school);
        let payload = StaffAccountPayload {
            email: "prof@ecole.sn",
            password: "Secret123!",
            full_name: full_name(" Moussa ", "Fall"),
            phone: None,
            role: Role::Teacher,
            school_id: school,
            created_by_user_id: caller.id,
            first_name: "Moussa",
            last_name: "Fall",
            class_id: None,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["fullName"], "Moussa Fall");
        assert_eq!(v["role"], "teacher");
        assert_eq!(v["createdByUserId"], caller.id.to_string());
        assert!(v.get("classId").is_none());
    }
}
