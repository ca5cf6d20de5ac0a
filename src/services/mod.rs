//! Role-scoped data access behind the console pages.
//!
//! Admins see every tenant; every other role is confined to its own
//! `school_id`. Reads go through the gateway cache, writes invalidate it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::credentials::CredentialError;
use crate::model::{Role, UserProfile};
use crate::supabase::{BackendError, Query};

pub mod apps;
pub mod classes;
pub mod enrollment;
pub mod notifications;
pub mod schools;
pub mod users;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Backend(BackendError::Decode(err))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub fn decode_rows<T: DeserializeOwned>(rows: &[Value]) -> Result<Vec<T>, BackendError> {
    rows.iter()
        .map(|row| serde_json::from_value(row.clone()).map_err(BackendError::from))
        .collect()
}

pub(crate) fn first_row<T: DeserializeOwned>(
    rows: &[Value],
    entity: &'static str,
    id: Uuid,
) -> ServiceResult<T> {
    decode_rows::<T>(rows)?
        .into_iter()
        .next()
        .ok_or(ServiceError::NotFound { entity, id })
}

pub(crate) fn require_role(caller: &UserProfile, allowed: &[Role]) -> ServiceResult<()> {
    if allowed.contains(&caller.role) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("role not allowed for this operation"))
    }
}

/// Restrict `query` to the caller's tenant unless the caller is an admin.
pub(crate) fn school_scope(caller: &UserProfile, query: Query, column: &str) -> ServiceResult<Query> {
    match caller.role {
        Role::Admin => Ok(query),
        _ => caller
            .school_id
            .map(|id| query.eq(column, id))
            .ok_or(ServiceError::Forbidden("caller is not attached to a school")),
    }
}

pub(crate) fn ensure_same_school(caller: &UserProfile, school_id: Uuid) -> ServiceResult<()> {
    match caller.role {
        Role::Admin => Ok(()),
        _ if caller.school_id == Some(school_id) => Ok(()),
        _ => Err(ServiceError::Forbidden("record belongs to another school")),
    }
}
