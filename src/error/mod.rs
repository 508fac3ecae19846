use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Conflict subcode carried by [`AppError::Conflict`] so clients can
/// distinguish the three 409 flavors without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another POI already exists within the proximity threshold.
    DuplicateLocation,
    /// The POI is at `max_participants`.
    Full,
    /// The user is already a member of this POI.
    AlreadyMember,
}

impl ConflictKind {
    pub fn code(self) -> &'static str {
        match self {
            ConflictKind::DuplicateLocation => "DUPLICATE_LOCATION",
            ConflictKind::Full => "POI_FULL",
            ConflictKind::AlreadyMember => "ALREADY_MEMBER",
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Redis / pub-sub unavailability. Safe to retry; surfaces as 503.
    #[error("Store unavailable: {0}")]
    Transient(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {1}")]
    Conflict(ConflictKind, String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded; retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e)
    }
}

/// Redis failures are transient by contract: a mutation that failed here was
/// never applied, so nothing is published and the caller may retry.
impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Transient(e.to_string())
    }
}

/// Flatten derive-validated field errors into one human-readable message.
impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(
            e.field_errors()
                .values()
                .flat_map(|v| v.iter())
                .filter_map(|e| e.message.as_ref())
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

impl AppError {
    /// Stable machine-readable code used in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Transient(_) => "STORE_UNAVAILABLE",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Validation(_) => "VALIDATION",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(kind, _) => kind.code(),
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::Internal => "INTERNAL",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let retry_after = match &self {
            AppError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };

        let (status, message, details) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_owned(),
                    None,
                )
            }
            AppError::Transient(e) => {
                tracing::warn!("Store unavailable: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_owned(),
                    None,
                )
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(_, msg) => (StatusCode::CONFLICT, msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            AppError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_owned(),
                Some(json!({ "retry_after": retry_after })),
            ),
            AppError::Internal => {
                tracing::error!("Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_owned(),
                    None,
                )
            }
        };

        let mut body = json!({ "code": code, "message": message });
        if let Some(details) = details {
            body["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn validation_error_returns_400() {
        let response = AppError::Validation("invalid input".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn not_found_returns_404_and_envelope() {
        let response = AppError::NotFound("POI not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["message"], "POI not found");
    }

    #[tokio::test]
    async fn conflict_subcodes_surface_in_envelope() {
        let cases = [
            (ConflictKind::DuplicateLocation, "DUPLICATE_LOCATION"),
            (ConflictKind::Full, "POI_FULL"),
            (ConflictKind::AlreadyMember, "ALREADY_MEMBER"),
        ];
        for (kind, expected) in cases {
            let response = AppError::Conflict(kind, "conflict".into()).into_response();
            assert_eq!(response.status(), StatusCode::CONFLICT);
            let json = body_json(response.into_body()).await;
            assert_eq!(json["code"], expected);
        }
    }

    #[tokio::test]
    async fn rate_limited_returns_429_with_retry_header_and_detail() {
        let response = AppError::RateLimited { retry_after: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("42")
        );
        let json = body_json(response.into_body()).await;
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["details"]["retry_after"], 42);
    }

    #[tokio::test]
    async fn transient_returns_503() {
        let response = AppError::Transient("redis down".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["code"], "STORE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn forbidden_returns_403() {
        let response = AppError::Forbidden("not your POI".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn internal_returns_500() {
        let response = AppError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
