// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus exposition of the relay state.
//!
//! The collector refreshes every gauge from the shared registry on a fixed interval. It
//! also drains the limit tag counters, which makes the collection interval the window the
//! limit ceilings apply to.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::{Body, Incoming},
    header, http,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::ServerError;
use crate::http_utils::{log_and_create_http_response, serve_tcp, HttpResponse};
use crate::registry::Registry;

pub struct Monitor {
    registry: Arc<Registry>,
    metrics: prometheus::Registry,
    req_count: IntGaugeVec,
    job_count: IntGaugeVec,
    stt_stats: IntGaugeVec,
    dropped: IntCounterVec,
    cached: IntCounterVec,
    replayed: IntCounterVec,
}

fn gauge_vec(
    metrics: &prometheus::Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntGaugeVec, prometheus::Error> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels)?;
    metrics.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter_vec(
    metrics: &prometheus::Registry,
    name: &str,
    help: &str,
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["location"])?;
    metrics.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Brings a counter up to a monotonic value read from elsewhere.
fn catch_up(counter: &IntCounterVec, location: &str, value: u64) {
    let counter = counter.with_label_values(&[location]);
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl Monitor {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let metrics = prometheus::Registry::new();
        Ok(Self {
            req_count: gauge_vec(
                &metrics,
                "relay_server_req_count",
                "Write requests waiting in the destination queue",
                &["location"],
            )?,
            job_count: gauge_vec(
                &metrics,
                "relay_server_job_count",
                "Deliveries running or waiting for a worker",
                &["location"],
            )?,
            stt_stats: gauge_vec(
                &metrics,
                "relay_server_stt_stats",
                "Lines seen per limit tag during the last interval",
                &["limit", "key"],
            )?,
            dropped: counter_vec(
                &metrics,
                "relay_server_dropped_total",
                "Write requests dropped on a full queue",
            )?,
            cached: counter_vec(
                &metrics,
                "relay_server_cached_total",
                "Batches written to the overflow cache",
            )?,
            replayed: counter_vec(
                &metrics,
                "relay_server_replayed_total",
                "Cached batches handed back to delivery",
            )?,
            registry,
            metrics,
        })
    }

    /// Refreshes every metric and resets the limit counters.
    pub fn collect(&self) {
        for destination in self.registry.destinations() {
            let location = destination.url();
            self.req_count
                .with_label_values(&[location])
                .set(destination.queue().len() as i64);
            self.job_count
                .with_label_values(&[location])
                .set(destination.pool().load() as i64);
            catch_up(&self.dropped, location, destination.queue().dropped());
            catch_up(&self.cached, location, destination.pool().stats().cached());
            catch_up(&self.replayed, location, destination.replayed());
        }

        self.stt_stats.reset();
        for rule in self.registry.limits().rules() {
            for (tag, count) in rule.counter().snapshot_and_reset() {
                self.stt_stats
                    .with_label_values(&[rule.name(), tag.as_str()])
                    .set(count as i64);
            }
        }
    }

    /// Prometheus text exposition of the last collection.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.metrics.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Monitor stopped");
                    return;
                }
                _ = ticker.tick() => self.collect(),
            }
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let service = service_fn(move |req: Request<Incoming>| {
            let monitor = Arc::clone(&self);
            async move { monitor.handle(req) }
        });
        serve_tcp(listener, service, cancel).await
    }

    pub fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => match self.render() {
                Ok(text) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, TextEncoder::new().format_type())
                    .body(Full::new(Bytes::from(text))),
                Err(e) => {
                    error!("Failed to encode metrics: {e}");
                    log_and_create_http_response(
                        "Failed to encode metrics",
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            },
            (_, path) => {
                log_and_create_http_response(&format!("Unknown path {path}"), StatusCode::NOT_FOUND)
            }
        }
    }
}
