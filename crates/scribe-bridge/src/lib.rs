// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bridge between the Scribe Thrift `Log` RPC and a tag-keyed event pipeline.
//!
//! The ingress side ([`server`], [`ingress`]) accepts `Log` batches, turns each
//! message into a structured record and emits it under a tag derived from its
//! category. The egress side ([`egress`], [`client`]) takes buffered records and
//! ships them to a remote Scribe server in batches.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer_service;
pub mod client;
pub mod config;
pub mod egress;
pub mod errors;
pub mod format;
pub mod ingress;
pub mod scribe;
pub mod server;
pub mod thrift;
pub mod util;
