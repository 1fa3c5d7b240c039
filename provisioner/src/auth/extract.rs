use super::{AclAuth, Subject};
use crate::serve::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use axum::RequestPartsExt;
use axum_extra::typed_header::TypedHeaderRejectionReason;
use axum_extra::TypedHeader;
use headers::authorization::Bearer;
use headers::Authorization;
use http::request::Parts;
use http::StatusCode;

#[async_trait]
impl FromRequestParts<AppState> for Subject {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = match parts.extract::<TypedHeader<Authorization<Bearer>>>().await {
            Ok(x) => x.0 .0,
            Err(rejection) => match rejection.reason() {
                TypedHeaderRejectionReason::Missing => {
                    tracing::warn!("no token present for request");
                    return Err(StatusCode::UNAUTHORIZED.into_response());
                }
                TypedHeaderRejectionReason::Error(e) => {
                    tracing::error!("failed to extract Authorization<Bearer>: {e:?}");
                    return Err(StatusCode::UNAUTHORIZED.into_response());
                }
                _ => return Err(StatusCode::UNAUTHORIZED.into_response()),
            },
        };
        state.tokens().authenticate(bearer.token()).ok_or_else(|| {
            tracing::warn!("failed to derive subject: unknown token");
            StatusCode::UNAUTHORIZED.into_response()
        })
    }
}

/// `axum` extractor for an [`AclAuth`] of the requesting subject.
#[derive(Debug)]
pub struct AuthSource(pub AclAuth);

#[async_trait]
impl FromRequestParts<AppState> for AuthSource {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        tracing::trace!("AuthSource::FromRequestParts");
        let subject = Subject::from_request_parts(parts, state).await?;
        Ok(AuthSource(AclAuth::new(state.acl(), subject)))
    }
}
