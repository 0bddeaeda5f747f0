//! A drop-in replacement for axum's `Json` extractor that reports every
//! rejection (bad syntax, a field that fails to deserialize, a missing
//! content-type) as a plain 400 through `CoreError` instead of axum's
//! default mix of 400/415/422, so clients see one uniform failure mode for
//! "the request body was wrong" across every POST handler.

use axum::Json;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;

use crate::error::CoreError;

pub struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(CoreError::InvalidInput(rejection.body_text())),
        }
    }
}
