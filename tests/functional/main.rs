// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests walking multi-step control plane scenarios against the
//! pure decision logic, without a live Kubernetes cluster.
//!
//! ```bash
//! cargo test --test functional
//! ```

mod deploy_flow;
mod epoch_replacement;
