// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use line_relay::config::{Config, StreamConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;

/// A relay configuration with one write stream on an ephemeral port and short timers.
pub fn relay_config(locations: &[String]) -> Config {
    let mut config = Config::default();
    config.batch.max_wait = Duration::from_millis(20);
    config.write.timeout = Duration::from_secs(5);
    config.write.delay_time = Duration::from_millis(10);
    config.monit.interval = Duration::from_millis(50);
    config.write.streams.push(StreamConfig {
        listen: "127.0.0.1:0".to_string(),
        location: locations.to_vec(),
    });
    config
}

/// Send an HTTP request over TCP and return the status and body
pub async fn send_request(
    addr: SocketAddr,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<(StatusCode, String), Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(addr),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", addr.to_string())
        .header("Content-Length", body.len().to_string());
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }
    let request = request_builder.body(Full::new(Bytes::from(body.to_string())))?;
    let response = timeout(Duration::from_secs(5), sender.send_request(request)).await??;

    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
}

pub async fn post_write(addr: SocketAddr, query: &str, body: &str) -> StatusCode {
    let uri = if query.is_empty() {
        "/write".to_string()
    } else {
        format!("/write?{query}")
    };
    send_request(addr, "POST", &uri, &[("Authorization", "Token test")], body)
        .await
        .expect("write request failed")
        .0
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Complete cache entries in `dir`.
pub fn cache_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_file() && !matches!(path.extension(), Some(ext) if ext == "tmp")
                })
                .collect()
        })
        .unwrap_or_default()
}
