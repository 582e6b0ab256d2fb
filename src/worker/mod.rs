// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Token workers: isolated custodian sessions behind a framed RPC, and the
//! per-token pools that supervise them.

pub mod pool;
mod rpc;
mod serve;

pub use pool::WorkerPool;
pub use rpc::Client;
pub use serve::{serve, serve_stream};
