//! Extractors whose rejections use the API error body

use crate::api::ApiError;
use crate::error::BqError;
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Query, Request,
    },
    http::request::Parts,
    response::Json,
};

/// JSON body; a malformed body is `InvalidRequest`
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| {
                ApiError(BqError::InvalidRequest(format!(
                    "invalid request body: {}",
                    rejection.body_text()
                )))
            })?;
        Ok(ApiJson(value))
    }
}

/// Query string; unknown or malformed parameters are `InvalidRequest`
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| {
                ApiError(BqError::InvalidRequest(format!(
                    "invalid query string: {}",
                    rejection.body_text()
                )))
            })?;
        Ok(ApiQuery(value))
    }
}
