// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::io;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    body::{Body, Incoming},
    header,
    http::{self, HeaderMap},
    Request, Response, StatusCode,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::ServerError;

pub type HttpResponse = Response<Full<Bytes>>;

/// Logs the given message and returns it in a JSON body with the given status code.
/// Success statuses log at debug, client errors at warn and everything else at error.
///
/// Response body format:
/// {
///     "message": message
/// }
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else if status.is_client_error() {
        warn!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// A response without a body, e.g. `204 No Content`.
pub fn empty_response(status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder().status(status).body(Full::new(Bytes::new()))
}

/// Checks the `Content-Length` header against `max_content_length`.
///
/// A missing header is accepted: chunked bodies are bounded while they are read, see
/// [`read_body`]. Returns a response to send back when the header is invalid or too large.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let content_length_header = header_map.get(header::CONTENT_LENGTH)?;
    let content_length = match content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        Some(res) => res,
        None => {
            return Some(log_and_create_http_response(
                &format!("{error_message_prefix}: Invalid Content-Length header"),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Payload too large"),
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
pub enum BodyError {
    TooLarge,
    Read(String),
}

/// Collects a request body, failing once it grows past `limit` bytes.
pub async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyError::TooLarge),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serves HTTP/1 connections from `listener` until `cancel` fires.
///
/// Connections that are still open when the listener stops are left to finish on their own.
pub async fn serve_tcp<S>(
    listener: TcpListener,
    service: S,
    cancel: CancellationToken,
) -> Result<(), ServerError>
where
    S: hyper::service::Service<Request<Incoming>, Response = HttpResponse>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: Error + Send + Sync + 'static,
{
    let addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = cancel.cancelled() => {
                debug!("Listener on {addr} stopped");
                joinset.detach_all();
                return Ok(());
            }
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(source) => {
                    error!("Server error on {addr}: {source}");
                    return Err(ServerError::Accept { addr, source });
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("Connection error: {e}");
            }
        });
    }
}
