// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics push gateway.
//!
//! Agents push time series over several wire protocols. Each request goes through the same
//! pipeline:
//!
//! ```text
//!   request ──> adapters ──> normalizer ──> dispatcher ──> writer target queues ──> writers
//!                               ^
//!                               │ lookup
//!   heartbeat ─────────────> registry <── sweeper
//! ```
//!
//! - [`adapters`]: one decoder per wire protocol, atomic or best-effort per protocol
//! - [`registry`]: identity registry fed by heartbeats, with TTL sweeping
//! - [`normalizer`]: canonical samples, attribution and the relabel hook
//! - [`dispatcher`]: bounded drop-oldest queues and one delivery worker per writer
//! - [`server`]: the HTTP surface

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod adapters;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod heartbeat;
pub mod http_utils;
pub mod normalizer;
pub mod pipeline;
pub mod prompb;
pub mod registry;
pub mod relabel;
pub mod sample;
pub mod server;
pub mod stats;
pub mod targets;
pub mod util;
pub mod writer;
