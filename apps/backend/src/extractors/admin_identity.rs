use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest};
use futures_util::future::{ready, Ready};

use crate::error::AppError;

pub const ADMIN_SUBJECT_HEADER: &str = "x-admin-subject";

/// Subject authenticated by the upstream gateway.
///
/// Authentication happens before requests reach this service; the extractor
/// only insists that the subject is present so privileged actions can be
/// attributed. No authorization decision is made here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminIdentity {
    pub subject: String,
}

impl FromRequest for AdminIdentity {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let subject = req
            .headers()
            .get(ADMIN_SUBJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty());

        ready(match subject {
            Some(subject) => Ok(AdminIdentity {
                subject: subject.to_string(),
            }),
            None => Err(AppError::unauthorized(format!(
                "missing {ADMIN_SUBJECT_HEADER} header"
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    #[actix_web::test]
    async fn subject_is_required_and_trimmed() {
        let req = TestRequest::default()
            .insert_header((ADMIN_SUBJECT_HEADER, "  ops@example.com "))
            .to_http_request();
        let identity = AdminIdentity::extract(&req).await.unwrap();
        assert_eq!(identity.subject, "ops@example.com");

        let blank = TestRequest::default()
            .insert_header((ADMIN_SUBJECT_HEADER, "   "))
            .to_http_request();
        assert!(AdminIdentity::extract(&blank).await.is_err());

        let missing = TestRequest::default().to_http_request();
        let err = AdminIdentity::extract(&missing).await.unwrap_err();
        assert_eq!(err.status(), actix_web::http::StatusCode::UNAUTHORIZED);
    }
}
