// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the configuration into running listeners, dispatchers, delivery pools and
//! background loops, and drains them on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::OverflowCache;
use crate::config::{normalize_location, Config, StreamConfig};
use crate::delivery::{build_client, Delivery, HttpDelivery, RetryPolicy};
use crate::dispatcher::Dispatcher;
use crate::endpoint::WriteEndpoint;
use crate::errors::{ConfigError, RelayError, ServerError};
use crate::http_utils::bind;
use crate::limits::Limits;
use crate::line_protocol::{LineProtocol, LineValidator};
use crate::monitor::Monitor;
use crate::pool;
use crate::query::QueryEndpoint;
use crate::queue::DestinationQueue;
use crate::registry::{Destination, DrainFlag, Registry};
use crate::replay::Replayer;

/// How many one-second ticks shutdown waits for queues and deliveries to empty.
pub const DRAIN_TICKS: u32 = 60;
pub const DRAIN_TICK: Duration = Duration::from_secs(1);

pub struct Relay {
    registry: Arc<Registry>,
    listeners: CancellationToken,
    background: CancellationToken,
    servers: JoinSet<Result<(), ServerError>>,
    tasks: JoinSet<()>,
    workers: Vec<JoinHandle<()>>,
    write_addrs: Vec<SocketAddr>,
    read_addrs: Vec<SocketAddr>,
    monit_addr: Option<SocketAddr>,
}

struct Bound {
    listener: TcpListener,
    addr: SocketAddr,
}

async fn bind_stream(listen: &str) -> Result<Bound, ServerError> {
    let listener = bind(listen).await?;
    let addr = listener.local_addr().map_err(|source| ServerError::Bind {
        addr: listen.to_string(),
        source,
    })?;
    Ok(Bound { listener, addr })
}

/// Normalized locations of a stream, each destination once.
fn locations(stream: &StreamConfig) -> Vec<String> {
    let mut locations: Vec<String> = Vec::with_capacity(stream.location.len());
    for location in &stream.location {
        let location = normalize_location(location);
        if !locations.contains(&location) {
            locations.push(location);
        }
    }
    locations
}

impl Relay {
    pub async fn start(config: &Config) -> Result<Relay, RelayError> {
        Self::start_with_validator(config, Arc::new(LineProtocol)).await
    }

    /// Starts the relay with a custom line validator.
    pub async fn start_with_validator(
        config: &Config,
        validator: Arc<dyn LineValidator>,
    ) -> Result<Relay, RelayError> {
        config.validate()?;
        let limits = Limits::from_config(&config.limits)?;

        // everything that can fail happens before the first task is spawned
        let mut write_listeners = Vec::with_capacity(config.write.streams.len());
        for stream in &config.write.streams {
            write_listeners.push((stream, bind_stream(&stream.listen).await?));
        }
        let mut read_listeners = Vec::with_capacity(config.read.streams.len());
        for stream in &config.read.streams {
            read_listeners.push((stream, bind_stream(&stream.listen).await?));
        }
        let monit_listener = match &config.monit.listen {
            Some(listen) => Some(bind_stream(listen).await?),
            None => None,
        };
        let cache = if config.cache.enabled {
            let directory = config.cache.directory.as_deref().ok_or_else(|| {
                ConfigError::Invalid("cache.directory is required when the cache is enabled".into())
            })?;
            let cache = OverflowCache::open(directory).await?;
            info!("Overflow cache enabled in {}", directory.display());
            Some(Arc::new(cache))
        } else {
            None
        };
        let write_client = build_client(config.write.timeout)?;
        let read_client = build_client(config.read.timeout)?;

        let drain = DrainFlag::default();
        let delivery: Arc<dyn Delivery> = Arc::new(HttpDelivery::new(
            write_client,
            RetryPolicy {
                attempts: config.write.repeat,
                delay: config.write.delay_time,
            },
            cache.clone(),
            drain.clone(),
        ));

        let background = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut destinations = Vec::new();
        let mut workers = Vec::new();
        for url in config.destinations() {
            let (queue, rx) = DestinationQueue::new(&url, config.batch.buffer_size);
            let (pool, handles) = pool::spawn(&url, config.write.threads, Arc::clone(&delivery));
            workers.extend(handles);
            let dispatcher = Dispatcher::new(
                &url,
                rx,
                pool.clone(),
                config.batch.size,
                config.batch.max_wait,
            );
            tasks.spawn(dispatcher.run(background.clone()));
            destinations.push(Destination::new(&url, queue, pool));
        }
        let registry = Arc::new(Registry::new(
            destinations,
            limits,
            drain,
            config.write.max_pending,
        ));

        if let Some(cache) = cache {
            let replayer = Replayer::new(
                cache,
                Arc::clone(&registry),
                config.cache.batch_size,
                config.cache.wait,
            );
            tasks.spawn(replayer.run(background.clone()));
        }
        let monitor = Arc::new(Monitor::new(Arc::clone(&registry))?);
        tasks.spawn(
            Arc::clone(&monitor).run(config.monit.interval, background.clone()),
        );

        let listeners = CancellationToken::new();
        let mut servers = JoinSet::new();
        let mut write_addrs = Vec::new();
        for (stream, bound) in write_listeners {
            let targets: Vec<Arc<Destination>> = locations(stream)
                .iter()
                .filter_map(|url| registry.destination(url).cloned())
                .collect();
            info!(
                "Write stream listening on {} for {}",
                bound.addr,
                stream.location.join(", ")
            );
            let endpoint = Arc::new(WriteEndpoint::new(
                targets,
                Arc::clone(&registry),
                Arc::clone(&validator),
                config.write.max_request_size,
            ));
            servers.spawn(endpoint.serve(bound.listener, listeners.clone()));
            write_addrs.push(bound.addr);
        }
        let mut read_addrs = Vec::new();
        for (stream, bound) in read_listeners {
            info!(
                "Read stream listening on {} for {}",
                bound.addr,
                stream.location.join(", ")
            );
            let endpoint = Arc::new(QueryEndpoint::new(
                locations(stream),
                read_client.clone(),
                Arc::clone(&registry),
                config.write.max_request_size,
            ));
            servers.spawn(endpoint.serve(bound.listener, listeners.clone()));
            read_addrs.push(bound.addr);
        }
        let monit_addr = monit_listener.map(|bound| {
            info!("Metrics listening on {}", bound.addr);
            servers.spawn(monitor.serve(bound.listener, listeners.clone()));
            bound.addr
        });

        Ok(Relay {
            registry,
            listeners,
            background,
            servers,
            tasks,
            workers,
            write_addrs,
            read_addrs,
            monit_addr,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bound addresses of the write streams, in configuration order.
    pub fn write_addrs(&self) -> &[SocketAddr] {
        &self.write_addrs
    }

    pub fn read_addrs(&self) -> &[SocketAddr] {
        &self.read_addrs
    }

    pub fn monit_addr(&self) -> Option<SocketAddr> {
        self.monit_addr
    }

    /// Resolves when a listener stops on its own, which only happens on an accept error.
    pub async fn listener_failed(&mut self) -> ServerError {
        loop {
            match self.servers.join_next().await {
                Some(Ok(Err(e))) => return e,
                Some(Ok(Ok(()))) => continue,
                Some(Err(e)) => {
                    error!("Listener task failed: {e}");
                    continue;
                }
                None => std::future::pending().await,
            }
        }
    }

    /// Closes the listeners, then waits up to `ticks` times `tick` for every queue and
    /// delivery pool to empty before stopping the background loops. Returns whether
    /// everything was delivered or cached in time.
    pub async fn shutdown(mut self, ticks: u32, tick: Duration) -> bool {
        info!("Shutting down, closing listeners");
        self.listeners.cancel();
        while let Some(result) = self.servers.join_next().await {
            if let Ok(Err(e)) = result {
                error!("{e}");
            }
        }
        self.registry.drain().start();

        let mut drained = self.registry.is_idle();
        let mut remaining = ticks;
        while !drained && remaining > 0 {
            let (queued, load) = self.backlog();
            info!("Draining: {queued} queued requests, {load} deliveries, {remaining} ticks left");
            tokio::time::sleep(tick).await;
            remaining -= 1;
            drained = self.registry.is_idle();
        }
        if drained {
            info!("All queues drained");
        } else {
            warn!("Shutdown timed out with work still pending");
        }

        self.background.cancel();
        while self.tasks.join_next().await.is_some() {}
        debug!("Background tasks stopped");

        // dispatchers flush on cancel, so the backlog is only final now
        let (queued, load) = self.backlog();
        if queued > 0 || load > 0 {
            error!(
                "Abandoning {load} batches and {queued} queued requests that were neither delivered nor cached"
            );
            drained = false;
        }
        for worker in &self.workers {
            worker.abort();
        }
        for worker in self.workers {
            let _ = worker.await;
        }
        drained
    }

    /// Queued write requests and delivery load summed over every destination.
    fn backlog(&self) -> (usize, usize) {
        self.registry
            .destinations()
            .iter()
            .fold((0, 0), |(queued, load), d| {
                (queued + d.queue().len(), load + d.pool().load())
            })
    }

    pub async fn drain(self) -> bool {
        self.shutdown(DRAIN_TICKS, DRAIN_TICK).await
    }
}
