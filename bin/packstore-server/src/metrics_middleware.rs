//! Metrics middleware for automatic request tracking
//!
//! Intercepts object requests and records metrics by operation.

use crate::http::{KEYS_COUNT_HEADER, KEYS_HEADER};
use crate::metrics::{Operation, server_metrics};
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, Method, header},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Operation type from the method; listing headers turn a GET into a listing
fn extract_operation(method: &Method, headers: &HeaderMap) -> Option<Operation> {
    let op = match *method {
        Method::GET if headers.contains_key(KEYS_HEADER) || headers.contains_key(KEYS_COUNT_HEADER) => {
            Operation::List
        }
        Method::GET => Operation::Get,
        Method::HEAD => Operation::Head,
        Method::OPTIONS => Operation::Options,
        Method::PUT => Operation::Put,
        Method::DELETE => Operation::Delete,
        _ => return None,
    };
    Some(op)
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Metrics middleware that records object operation metrics
pub async fn metrics_layer(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let operation = extract_operation(request.method(), request.headers());
    let request_bytes = content_length(request.headers());

    let response = next.run(request).await;

    if let Some(op) = operation {
        let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        server_metrics().record_operation(
            op,
            response.status().as_u16(),
            request_bytes,
            content_length(response.headers()),
            latency_us,
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_operation() {
        let plain = HeaderMap::new();
        assert_eq!(extract_operation(&Method::GET, &plain), Some(Operation::Get));
        assert_eq!(extract_operation(&Method::PUT, &plain), Some(Operation::Put));
        assert_eq!(extract_operation(&Method::POST, &plain), None);

        let mut listing = HeaderMap::new();
        listing.insert(KEYS_COUNT_HEADER, HeaderValue::from_static("all"));
        assert_eq!(extract_operation(&Method::GET, &listing), Some(Operation::List));
        assert_eq!(extract_operation(&Method::HEAD, &listing), Some(Operation::Head));
    }
}
