use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;

use actix_web::dev::Payload;
use actix_web::web::{Bytes, Query};
use actix_web::{FromRequest, HttpRequest};
use futures_util::future::{ready, Ready};
use serde::de::DeserializeOwned;
use serde_json::Error as JsonError;
use tracing::debug;

use crate::error::AppError;
use crate::errors::ErrorCode;

/// JSON body whose parse failures become `BAD_REQUEST` problem responses
/// instead of actix's plain-text 400.
#[derive(Debug)]
pub struct ValidatedJson<T>(pub T);

impl<T> ValidatedJson<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for ValidatedJson<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> FromRequest for ValidatedJson<T>
where
    T: DeserializeOwned + 'static,
{
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let body = Bytes::from_request(req, payload);

        Box::pin(async move {
            let body = body.await.map_err(|e| {
                debug!(error = %e, "failed to read request body");
                AppError::bad_request(ErrorCode::BadRequest, "Failed to read request body")
            })?;
            let parsed = serde_json::from_slice::<T>(&body).map_err(|e| {
                debug!(error = %e, body_size = body.len(), "JSON parsing failed");
                AppError::bad_request(ErrorCode::BadRequest, classify_json_error(&e))
            })?;
            Ok(ValidatedJson(parsed))
        })
    }
}

/// Query string with the same problem-response treatment as [`ValidatedJson`].
#[derive(Debug)]
pub struct ValidatedQuery<T>(pub T);

impl<T> ValidatedQuery<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for ValidatedQuery<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> FromRequest for ValidatedQuery<T>
where
    T: DeserializeOwned,
{
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            Query::<T>::from_query(req.query_string())
                .map(|q| ValidatedQuery(q.into_inner()))
                .map_err(|e| {
                    AppError::bad_request(ErrorCode::BadRequest, format!("Invalid query: {e}"))
                }),
        )
    }
}

fn classify_json_error(error: &JsonError) -> String {
    match error.classify() {
        serde_json::error::Category::Syntax => {
            format!("Invalid JSON at line {}", error.line())
        }
        serde_json::error::Category::Eof => "Invalid JSON: unexpected end of input".to_string(),
        serde_json::error::Category::Data => {
            "Invalid JSON: wrong types for one or more fields".to_string()
        }
        serde_json::error::Category::Io => "Invalid JSON: I/O error while reading body".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Transition {
        #[allow(dead_code)]
        status: String,
    }

    #[test]
    fn json_errors_are_classified_without_echoing_input() {
        let eof = serde_json::from_str::<Transition>(r#"{"status": "ACT"#).unwrap_err();
        assert!(classify_json_error(&eof).contains("unexpected end of input"));

        let data = serde_json::from_str::<Transition>(r#"{"status": 7}"#).unwrap_err();
        assert!(classify_json_error(&data).contains("wrong types"));

        let syntax = serde_json::from_str::<Transition>(r#"{"status": }"#).unwrap_err();
        assert!(classify_json_error(&syntax).starts_with("Invalid JSON at line"));
    }
}
