// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner clients.
//!
//! The control plane talks to runners through [`RunnerClient`]. The HTTP
//! implementation is used in production, and [`MockRunner`] hosts verbs
//! in-process for tests and embedded use.

pub mod http;
pub mod mock;
mod traits;

pub use http::{HttpClientFactory, HttpRunnerClient};
pub use mock::{MockFleet, MockRunner};
pub use traits::*;
