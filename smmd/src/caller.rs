//! Request caller: the single capability gate of the HTTP layer.
//!
//! The authenticating gateway in front of smmd sets `x-user-id` and,
//! for operators, `x-user-role: admin`. Handlers take a [`Caller`] and ask
//! it what the request may do; no handler reads the headers itself.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use uuid::Uuid;

use smm_domain::{Order, UserId};
use smm_exec::OrderScope;

use crate::api::ErrorResponse;

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the caller role
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Caller role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Regular customer
    User,
    /// Operator with access to every account and order
    Admin,
}

/// Authenticated caller of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Authenticated user
    pub user_id: UserId,
    /// Role granted by the gateway
    pub role: Role,
}

impl Caller {
    /// True for operators
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Reject non-admin callers with 403.
    pub fn require_admin(&self) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
        if self.is_admin() {
            Ok(())
        } else {
            Err((
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: "Admin role required".to_string(),
                }),
            ))
        }
    }

    /// Orders visible in listings
    pub fn order_scope(&self) -> OrderScope {
        match self.role {
            Role::Admin => OrderScope::All,
            Role::User => OrderScope::User(self.user_id),
        }
    }

    /// Owners and admins may read an order
    pub fn can_view(&self, order: &Order) -> bool {
        self.is_admin() || order.user_id == self.user_id
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| unauthorized("Missing x-user-id header"))?
            .to_str()
            .map_err(|_| unauthorized("Invalid x-user-id header"))?;

        let user_id =
            Uuid::parse_str(raw.trim()).map_err(|_| unauthorized("Invalid x-user-id header"))?;

        let role = match parts.headers.get(USER_ROLE_HEADER).and_then(|v| v.to_str().ok()) {
            Some(role) if role.trim().eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::User,
        };

        Ok(Self { user_id, role })
    }
}
