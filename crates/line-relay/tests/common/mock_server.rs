// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock downstream database for relay tests
//!
//! Answers with scripted status codes and can hold every request until the test
//! releases it, which makes delivery concurrency observable.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct State {
    received: Mutex<Vec<ReceivedRequest>>,
    script: Mutex<VecDeque<u16>>,
    default_status: u16,
    gate: Option<Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone)]
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<State>,
}

impl MockServer {
    /// Accepts everything with 204.
    pub async fn start() -> Self {
        Self::start_with(&[], 204, false).await
    }

    /// Answers with `statuses` in order, then with `default_status`.
    pub async fn with_statuses(statuses: &[u16], default_status: u16) -> Self {
        Self::start_with(statuses, default_status, false).await
    }

    /// Holds every request until [`MockServer::release`] lets it through, then answers 204.
    pub async fn gated() -> Self {
        Self::start_with(&[], 204, true).await
    }

    async fn start_with(statuses: &[u16], default_status: u16, gated: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let state = Arc::new(State {
            received: Mutex::new(Vec::new()),
            script: Mutex::new(statuses.iter().copied().collect()),
            default_status,
            gate: gated.then(|| Semaphore::new(0)),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let server_state = state.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let io = TokioIo::new(stream);
                let state = server_state.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, hyper::http::Error>(respond(&state, req).await) }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockServer { addr, state }
    }

    /// Base URL of the mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn requests_for_path(&self, path: &str) -> Vec<ReceivedRequest> {
        self.requests()
            .into_iter()
            .filter(|req| req.path == path)
            .collect()
    }

    /// Lets `n` held requests through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.state.gate {
            gate.add_permits(n);
        }
    }

    /// Requests received and not answered yet
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Most requests ever held at the same time
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

async fn respond(state: &State, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| String::from_utf8_lossy(&collected.to_bytes()).into_owned())
        .unwrap_or_default();

    state.received.lock().unwrap().push(ReceivedRequest {
        method,
        path,
        query,
        headers,
        body,
    });

    let running = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(running, Ordering::SeqCst);
    if let Some(gate) = &state.gate {
        gate.acquire().await.unwrap().forget();
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let status = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(state.default_status);
    let body = if status == 204 {
        Bytes::new()
    } else {
        Bytes::from_static(br#"{"ok":true}"#)
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body))
        .unwrap()
}
