// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read listeners: `/query` is forwarded to each location in turn until one answers
//! below 400.

use std::error::Error;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::{Body, Incoming},
    header, http,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ServerError;
use crate::http_utils::{
    empty_response, log_and_create_http_response, read_body, serve_tcp, BodyError, HttpResponse,
};
use crate::registry::Registry;

pub struct QueryEndpoint {
    locations: Vec<String>,
    client: reqwest::Client,
    registry: Arc<Registry>,
    max_request_size: usize,
}

impl QueryEndpoint {
    pub fn new(
        locations: Vec<String>,
        client: reqwest::Client,
        registry: Arc<Registry>,
        max_request_size: usize,
    ) -> Self {
        Self {
            locations,
            client,
            registry,
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
            (&Method::GET | &Method::POST, "/query") => self.forward(req).await,
            (_, "/query") => log_and_create_http_response(
                &format!("Unsupported method {} for /query", req.method()),
                StatusCode::METHOD_NOT_ALLOWED,
            ),
            (_, path) => {
                log_and_create_http_response(&format!("Unknown path {path}"), StatusCode::NOT_FOUND)
            }
        }
    }

    /// Healthy while at least one location could take another write right away.
    fn ping(&self) -> http::Result<HttpResponse> {
        let available = self.locations.iter().any(|location| {
            self.registry
                .destination(location)
                .map_or(true, |destination| destination.pool().has_capacity())
        });
        if available {
            empty_response(StatusCode::NO_CONTENT)
        } else {
            log_and_create_http_response(
                "Every location is busy",
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
    }

    async fn forward<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let body = match read_body(body, self.max_request_size).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                return log_and_create_http_response(
                    "Query refused: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                )
            }
            Err(BodyError::Read(e)) => {
                return log_and_create_http_response(
                    &format!("Query refused: unable to read body: {e}"),
                    StatusCode::BAD_REQUEST,
                )
            }
        };

        for location in &self.locations {
            let url = match parts.uri.query() {
                Some(query) => format!("{location}/query?{query}"),
                None => format!("{location}/query"),
            };
            let mut request = self
                .client
                .request(parts.method.clone(), &url)
                .body(body.clone());
            for name in [header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT] {
                if let Some(value) = parts.headers.get(&name) {
                    request = request.header(name, value.clone());
                }
            }

            match request.send().await {
                Ok(response) if response.status().as_u16() < 400 => {
                    return relay_response(response).await;
                }
                Ok(response) => debug!("{} answered {url}", response.status()),
                Err(e) => warn!("Query to {url} failed: {e}"),
            }
        }
        log_and_create_http_response(
            "No location answered the query",
            StatusCode::SERVICE_UNAVAILABLE,
        )
    }
}

async fn relay_response(response: reqwest::Response) -> http::Result<HttpResponse> {
    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return log_and_create_http_response(
                &format!("Failed to read query response: {e}"),
                StatusCode::BAD_GATEWAY,
            )
        }
    };
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(Full::new(Bytes::from(body)))
}
