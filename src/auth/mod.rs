use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::AppError;

/// The authenticated principal for an HTTP request.
///
/// Token issuance and validation live at the gateway; by the time a request
/// reaches this service the verified user id has been injected as the
/// `X-User-Id` header. This extractor only consumes it.
#[derive(Debug, Clone, Copy)]
pub struct Principal(pub Uuid);

impl Principal {
    pub fn user_id(&self) -> Uuid {
        self.0
    }
}

pub const PRINCIPAL_HEADER: &str = "x-user-id";

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".into()))?;

        let user_id = Uuid::parse_str(raw)
            .map_err(|_| AppError::Unauthorized("Invalid X-User-Id header".into()))?;

        Ok(Principal(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Principal, AppError> {
        let (mut parts, _) = request.into_parts();
        Principal::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn valid_header_yields_principal() {
        let user_id = Uuid::new_v4();
        let request = Request::builder()
            .header("X-User-Id", user_id.to_string())
            .body(())
            .unwrap();
        let principal = extract(request).await.unwrap();
        assert_eq!(principal.user_id(), user_id);
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let request = Request::builder().body(()).unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn malformed_header_is_unauthorized() {
        let request = Request::builder()
            .header("X-User-Id", "not-a-uuid")
            .body(())
            .unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AppError::Unauthorized(_))
        ));
    }
}
