//! Principal extraction.
//!
//! Authentication happens upstream; by the time a request reaches this
//! service the gateway has verified the caller and forwarded its id in
//! `x-principal-id`. Handlers only enforce ownership against it.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{errors::AppError, services::UploadError};

pub const PRINCIPAL_HEADER: &str = "x-principal-id";
pub const ROLE_HEADER: &str = "x-principal-role";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// The verified caller of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    /// Owner of the resource, or holder of the elevated role.
    pub fn may_access(&self, owner_id: &str) -> bool {
        self.role == Role::Admin || self.id == owner_id
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(UploadError::Unauthenticated)?;

        match parts.headers.get(ROLE_HEADER).and_then(|v| v.to_str().ok()) {
            Some(role) if role.eq_ignore_ascii_case("admin") => Ok(Principal::admin(id)),
            _ => Ok(Principal::user(id)),
        }
    }
}
