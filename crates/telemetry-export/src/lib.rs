// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Export
//!
//! The harvest-and-export pipeline of an APM agent: it buffers telemetry
//! produced inside a monitored process and delivers it to a remote collector.
//!
//! ## Architecture
//!
//! - [`aggregator`]: per-type reservoirs with timer-driven harvests, plus the
//!   streaming aggregator feeding the partitioned queue
//! - [`queue`]: bounded, partitioned, multi-consumer queue
//! - [`streaming`]: long-lived streaming export with a reconnect state machine
//! - [`sender`]: request/response sender with retry, compression and payload
//!   admission
//! - [`session`]: collector handshake and reconnect scheduling
//! - [`collector`]: maps collector responses to harvest outcomes
//! - [`pipeline`]: shutdown and flush-on-exit coordination
//!
//! Nothing in this crate ever returns an error into producer code paths:
//! `collect` style entry points drop telemetry and count it instead.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod backoff;
pub mod collector;
pub mod config;
pub mod errors;
pub mod item;
pub mod lifecycle;
pub mod logger;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod sender;
pub mod session;
pub mod streaming;
pub mod transport;

/// Number of attempts the request sender makes before giving up.
pub(crate) const MAX_SEND_ATTEMPTS: u32 = 3;
