//! Caller identity.
//!
//! Authentication happens in front of this service; whoever sits there
//! forwards the authenticated user id in the `X-User-Id` header.

use crate::error::CoreError;
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest};
use std::future::{ready, Ready};

pub const USER_HEADER: &str = "X-User-Id";

/// The authenticated caller. Extracting it fails with 401 when the header is
/// missing or blank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl FromRequest for Caller {
    type Error = CoreError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let caller = req
            .headers()
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| Caller(user.to_string()))
            .ok_or(CoreError::Unauthorized);
        ready(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use assert_matches::assert_matches;

    #[actix_web::test]
    async fn reads_trimmed_header() {
        let req = TestRequest::default()
            .insert_header((USER_HEADER, " alice "))
            .to_http_request();
        let caller = Caller::extract(&req).await.unwrap();
        assert_eq!(caller.id(), "alice");
    }

    #[actix_web::test]
    async fn missing_or_blank_header_is_unauthorized() {
        let req = TestRequest::default().to_http_request();
        assert_matches!(Caller::extract(&req).await, Err(CoreError::Unauthorized));

        let req = TestRequest::default()
            .insert_header((USER_HEADER, "   "))
            .to_http_request();
        assert_matches!(Caller::extract(&req).await, Err(CoreError::Unauthorized));
    }
}
