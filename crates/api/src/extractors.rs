//! Request extractors.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};
use postbox_common::AppError;
use serde::de::DeserializeOwned;

/// JSON body whose rejections use the application error shape.
///
/// axum's own `Json` answers malformed bodies with plain text; clients of
/// this API always get `{"error": {"code", "message"}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection_to_error(&rejection)),
        }
    }
}

fn rejection_to_error(rejection: &JsonRejection) -> AppError {
    match rejection {
        JsonRejection::JsonDataError(e) => AppError::Validation(e.body_text()),
        JsonRejection::JsonSyntaxError(e) => AppError::BadRequest(e.body_text()),
        JsonRejection::MissingJsonContentType(_) => {
            AppError::BadRequest("Expected a JSON request body".to_string())
        }
        other => AppError::BadRequest(other.body_text()),
    }
}
