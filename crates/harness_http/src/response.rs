// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Response;
pub use hyper::StatusCode;

/// Fully buffered HTTP response, which is all the webhook and control planes ever need.
pub type GenericResponse = Response<Full<Bytes>>;

pub const JSON: &str = "application/json";
pub const TEXT: &str = "text/plain; charset=utf-8";

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl Into<Bytes>,
) -> GenericResponse {
    let mut response = Response::new(Full::new(content.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, TEXT, content.to_string())
}

/// Return a JSON response with already-encoded content.
pub fn json(status: StatusCode, content: impl Into<Bytes>) -> GenericResponse {
    full(status, JSON, content)
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt;

    fn to_body(response: GenericResponse) -> Vec<u8> {
        let body = response.into_body().collect();
        futures::executor::block_on(body)
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[test]
    fn sanity_check_text_response() {
        let response = text(StatusCode::NOT_IMPLEMENTED, format_args!("x = {}", 3));
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), TEXT);
        assert_eq!(to_body(response), b"x = 3");
    }

    #[test]
    fn json_responses_are_labelled() {
        let response = json(StatusCode::OK, "{}");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), JSON);
        assert_eq!(to_body(response), b"{}");
    }

    #[test]
    fn not_found_is_plain_text() {
        let response = not_found();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(to_body(response), b"404 not found");
    }
}
