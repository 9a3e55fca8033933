// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The write listener: `POST /write` and `GET /ping`.
//!
//! Every line of a write body goes through the validator and the admission limits. The
//! surviving lines are copied onto the queue of every destination of the stream. A request
//! is only refused as a whole when nothing survives.

use std::error::Error;
use std::sync::Arc;

use hyper::{
    body::{Body, Incoming},
    header,
    http,
    service::service_fn,
    Method, Request, StatusCode,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::WriteRequest;
use crate::errors::ServerError;
use crate::http_utils::{
    empty_response, log_and_create_http_response, read_body, serve_tcp,
    verify_request_content_length, BodyError, HttpResponse,
};
use crate::limits::{Limits, Rejection, Verdict};
use crate::line_protocol::{is_ignorable, LineValidator};
use crate::queue::Enqueue;
use crate::registry::{Destination, Registry};

/// Result of running one write body through admission.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Admission {
    pub accepted: Vec<String>,
    pub invalid: usize,
    pub unmatched: usize,
    pub exceeded: usize,
}

impl Admission {
    pub fn rejected(&self) -> usize {
        self.invalid + self.unmatched + self.exceeded
    }

    /// Status for a request in which no line survived.
    fn refusal_status(&self) -> StatusCode {
        if self.exceeded > 0 {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::BAD_REQUEST
        }
    }
}

/// Splits `body` into lines and keeps those the validator and limits let through.
pub fn admit(body: &str, validator: &dyn LineValidator, limits: &Limits) -> Admission {
    let mut admission = Admission::default();
    for line in body.split('\n') {
        let line = line.trim_end_matches('\r');
        if is_ignorable(line) {
            continue;
        }
        if let Err(e) = validator.validate(line) {
            debug!("Invalid line ({e}): {line}");
            admission.invalid += 1;
            continue;
        }
        match limits.check(line) {
            Verdict::Accept | Verdict::Tagged(_) => admission.accepted.push(line.to_string()),
            Verdict::Reject(Rejection::Unmatched { limit }) => {
                debug!("Line does not match required limit {limit}: {line}");
                admission.unmatched += 1;
            }
            Verdict::Reject(Rejection::VolumeExceeded { limit, tag }) => {
                debug!(
                    "Limit {limit} exceeded for {}: {line}",
                    tag.as_deref().unwrap_or("unmatched line")
                );
                admission.exceeded += 1;
            }
        }
    }
    admission
}

pub struct WriteEndpoint {
    destinations: Vec<Arc<Destination>>,
    registry: Arc<Registry>,
    validator: Arc<dyn LineValidator>,
    max_request_size: usize,
}

impl WriteEndpoint {
    pub fn new(
        destinations: Vec<Arc<Destination>>,
        registry: Arc<Registry>,
        validator: Arc<dyn LineValidator>,
        max_request_size: usize,
    ) -> Self {
        Self {
            destinations,
            registry,
            validator,
            max_request_size,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let service = service_fn(move |req: Request<Incoming>| {
            let endpoint = Arc::clone(&self);
            async move { endpoint.handle(req).await }
        });
        serve_tcp(listener, service, cancel).await
    }

    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (_, "/ping") => self.ping(),
            (&Method::POST, "/write") => self.write(req).await,
            (_, "/write") => log_and_create_http_response(
                &format!("Unsupported method {} for /write", req.method()),
                StatusCode::METHOD_NOT_ALLOWED,
            ),
            (_, path) => {
                log_and_create_http_response(&format!("Unknown path {path}"), StatusCode::NOT_FOUND)
            }
        }
    }

    fn ping(&self) -> http::Result<HttpResponse> {
        if self.registry.drain().is_draining() {
            return log_and_create_http_response(
                "Relay is shutting down",
                StatusCode::SERVICE_UNAVAILABLE,
            );
        }
        if self.registry.backlog_exceeded() {
            return log_and_create_http_response(
                "Delivery backlog exceeded",
                StatusCode::SERVICE_UNAVAILABLE,
            );
        }
        empty_response(StatusCode::NO_CONTENT)
    }

    async fn write<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        if self.registry.drain().is_draining() {
            return log_and_create_http_response(
                "Relay is shutting down, write refused",
                StatusCode::SERVICE_UNAVAILABLE,
            );
        }
        if let Some(response) =
            verify_request_content_length(req.headers(), self.max_request_size, "Write refused")
        {
            return response;
        }

        let (parts, body) = req.into_parts();
        let body = match read_body(body, self.max_request_size).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                return log_and_create_http_response(
                    "Write refused: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                )
            }
            Err(BodyError::Read(e)) => {
                return log_and_create_http_response(
                    &format!("Write refused: unable to read body: {e}"),
                    StatusCode::BAD_REQUEST,
                )
            }
        };
        let Ok(body) = std::str::from_utf8(&body) else {
            return log_and_create_http_response(
                "Write refused: body is not valid UTF-8",
                StatusCode::BAD_REQUEST,
            );
        };

        // forwarded as is, so it only has to survive the round trip through a String
        let credential = match parts.headers.get(header::AUTHORIZATION) {
            None => None,
            Some(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(credential) => Some(credential.to_string()),
                Err(_) => {
                    return log_and_create_http_response(
                        "Write refused: Authorization header is not valid UTF-8",
                        StatusCode::BAD_REQUEST,
                    )
                }
            },
        };

        let admission = admit(body, self.validator.as_ref(), self.registry.limits());
        if admission.accepted.is_empty() {
            return log_and_create_http_response(
                &format!(
                    "Write refused: no line accepted ({} invalid, {} unmatched, {} over limit)",
                    admission.invalid, admission.unmatched, admission.exceeded
                ),
                admission.refusal_status(),
            );
        }
        if admission.rejected() > 0 {
            debug!(
                "Accepted {} lines, rejected {}",
                admission.accepted.len(),
                admission.rejected()
            );
        }

        let query = parts.uri.query().unwrap_or_default().to_string();

        let mut queued = 0;
        for destination in &self.destinations {
            let request = WriteRequest {
                destination: destination.url().to_string(),
                credential: credential.clone(),
                query: query.clone(),
                lines: admission.accepted.clone(),
            };
            if destination.queue().try_enqueue(request) == Enqueue::Queued {
                queued += 1;
            }
        }
        if queued == 0 {
            return log_and_create_http_response(
                "Write refused: every destination queue is full",
                StatusCode::SERVICE_UNAVAILABLE,
            );
        }
        empty_response(StatusCode::NO_CONTENT)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::limits::{LimitRule, UnmatchedPolicy};
    use crate::line_protocol::LineProtocol;
    use crate::pool::PoolHandle;
    use crate::queue::DestinationQueue;
    use crate::registry::DrainFlag;
    use bytes::Bytes;
    use http_body_util::Full;
    use tokio::sync::mpsc::{Receiver, UnboundedReceiver};

    struct Fixture {
        endpoint: WriteEndpoint,
        registry: Arc<Registry>,
        queued: Receiver<WriteRequest>,
        _batches: UnboundedReceiver<Batch>,
    }

    fn fixture(limits: Limits, capacity: usize) -> Fixture {
        let (queue, queued) = DestinationQueue::new("http://a", capacity);
        let (pool, batches) = PoolHandle::channel(2);
        let registry = Arc::new(Registry::new(
            vec![Destination::new("http://a", queue, pool)],
            limits,
            DrainFlag::default(),
            100,
        ));
        let endpoint = WriteEndpoint::new(
            registry.destinations().to_vec(),
            Arc::clone(&registry),
            Arc::new(LineProtocol),
            1024,
        );
        Fixture {
            endpoint,
            registry,
            queued,
            _batches: batches,
        }
    }

    fn write(uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::AUTHORIZATION, "Token abc")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn limited(ceiling: u64, unmatched: UnmatchedPolicy) -> Limits {
        Limits::new(vec![LimitRule::new(
            "per_host",
            r"^(\w+),.*host=([^,\s]+).*",
            "$1:$2",
            ceiling,
            unmatched,
        )
        .unwrap()])
    }

    #[test]
    fn test_admit_skips_blank_and_comment_lines() {
        let admission = admit(
            "cpu value=1\r\n\n# comment\nbroken\nmem used=2\n",
            &LineProtocol,
            &Limits::default(),
        );
        assert_eq!(admission.accepted, vec!["cpu value=1", "mem used=2"]);
        assert_eq!(admission.invalid, 1);
        assert_eq!(admission.rejected(), 1);
    }

    #[tokio::test]
    async fn test_write_enqueues_surviving_lines() {
        let mut fixture = fixture(Limits::default(), 4);
        let response = fixture
            .endpoint
            .handle(write("/write?db=test&precision=s", "cpu value=1\nbad\ncpu value=2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let request = fixture.queued.try_recv().unwrap();
        assert_eq!(request.destination, "http://a");
        assert_eq!(request.query, "db=test&precision=s");
        assert_eq!(request.credential.as_deref(), Some("Token abc"));
        assert_eq!(request.lines, vec!["cpu value=1", "cpu value=2"]);
    }

    #[tokio::test]
    async fn test_non_ascii_credential_is_passed_through() {
        let mut fixture = fixture(Limits::default(), 4);
        let mut request = write("/write", "cpu value=1");
        request.headers_mut().insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_bytes("Basic café".as_bytes()).unwrap(),
        );
        let response = fixture.endpoint.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let queued = fixture.queued.try_recv().unwrap();
        assert_eq!(queued.credential.as_deref(), Some("Basic café"));
    }

    #[tokio::test]
    async fn test_credential_that_is_not_utf8_is_refused() {
        let mut fixture = fixture(Limits::default(), 4);
        let mut request = write("/write", "cpu value=1");
        request.headers_mut().insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_bytes(b"Basic caf\xe9").unwrap(),
        );
        let response = fixture.endpoint.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(fixture.queued.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_all_invalid_is_bad_request() {
        let mut fixture = fixture(Limits::default(), 4);
        let response = fixture
            .endpoint
            .handle(write("/write?db=test", "bad\nworse"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(fixture.queued.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmatched_reject_is_bad_request() {
        let fixture = fixture(limited(0, UnmatchedPolicy::Reject), 4);
        let response = fixture
            .endpoint
            .handle(write("/write", "cpu value=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_volume_exceeded_is_service_unavailable() {
        let fixture = fixture(limited(1, UnmatchedPolicy::Pass), 4);
        let body = "cpu,host=a value=1\ncpu,host=a value=2";
        let first = fixture.endpoint.handle(write("/write", body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::NO_CONTENT);

        let second = fixture.endpoint.handle(write("/write", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unmatched_exceed_is_service_unavailable() {
        let fixture = fixture(limited(0, UnmatchedPolicy::Exceed), 4);
        let response = fixture
            .endpoint
            .handle(write("/write", "cpu value=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_full_queue_refuses_write() {
        let fixture = fixture(Limits::default(), 1);
        let ok = fixture
            .endpoint
            .handle(write("/write", "cpu value=1"))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::NO_CONTENT);
        let full = fixture
            .endpoint
            .handle(write("/write", "cpu value=2"))
            .await
            .unwrap();
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fixture.registry.destinations()[0].queue().dropped(), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused() {
        let fixture = fixture(Limits::default(), 4);
        let body = "cpu value=1\n".repeat(200);
        let response = fixture.endpoint.handle(write("/write", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_draining_refuses_write_and_ping() {
        let fixture = fixture(Limits::default(), 4);
        let ping = Request::get("/ping").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(
            fixture.endpoint.handle(ping).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );

        fixture.registry.drain().start();
        let response = fixture
            .endpoint
            .handle(write("/write", "cpu value=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let ping = Request::get("/ping").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(
            fixture.endpoint.handle(ping).await.unwrap().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_wrong_method_and_path() {
        let fixture = fixture(Limits::default(), 4);
        let get = Request::get("/write").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(
            fixture.endpoint.handle(get).await.unwrap().status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        let other = Request::get("/other").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(
            fixture.endpoint.handle(other).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );
    }
}
