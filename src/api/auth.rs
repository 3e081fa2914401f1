//! Actor extraction. Identity issuance is handled upstream; requests
//! arrive with a resolved actor id and role in headers.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;
use crate::types::{Actor, Role};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(AppError::AuthRequired)?;
        let role = parts
            .headers
            .get(ACTOR_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| Role::parse(v).ok_or_else(|| AppError::Validation(format!("unknown role {v}"))))
            .transpose()?
            .unwrap_or(Role::User);
        Ok(Actor::new(id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<Actor, AppError> {
        let (mut parts, _) = req.into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_actor_from_headers() {
        let req = Request::builder()
            .header(ACTOR_ID_HEADER, "u1")
            .header(ACTOR_ROLE_HEADER, "admin")
            .body(())
            .unwrap();
        let actor = extract(req).await.unwrap();
        assert_eq!(actor.id, "u1");
        assert!(actor.role.is_admin());
    }

    #[tokio::test]
    async fn test_missing_actor_rejected() {
        let req = Request::builder().body(()).unwrap();
        let err = extract(req).await.unwrap_err();
        assert_eq!(err.kind(), "auth_required");
    }

    #[tokio::test]
    async fn test_role_defaults_to_user() {
        let req = Request::builder()
            .header(ACTOR_ID_HEADER, "u1")
            .body(())
            .unwrap();
        let actor = extract(req).await.unwrap();
        assert_eq!(actor.role, Role::User);
    }
}
