use axum::{extract::FromRequestParts, http::request::Parts};
use theatre_core::Recipient;

use crate::error::ApiError;

pub const RECIPIENT_ID_HEADER: &str = "x-recipient-id";
pub const RECIPIENT_ROLE_HEADER: &str = "x-recipient-role";

/// Caller identity forwarded by the session layer in front of the hub.
#[derive(Debug, Clone)]
pub struct Identity(pub Recipient);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_value(parts, RECIPIENT_ID_HEADER).ok_or(ApiError::Unauthorized)?;
        let role = header_value(parts, RECIPIENT_ROLE_HEADER).ok_or(ApiError::Unauthorized)?;
        Ok(Identity(Recipient::new(id, role)))
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
