// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod endpoint;
pub mod errors;
pub mod http_utils;
pub mod limits;
pub mod line_protocol;
pub mod monitor;
pub mod pool;
pub mod query;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod replay;
