//! Gatehost Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Gatehost core
//! to run both in **Production** (tokio) and in the **Simulation** harness.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything the core touches outside its own memory is intercepted:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Work placement (`spawn()`, `spawn_blocking()`)
//! - Network (`send()`, `broadcast()`, `recv()`)
//!
//! The network abstraction is deliberately weak: it moves intact byte frames
//! on a numbered channel to a named endpoint and promises nothing about
//! ordering, retries or security. Everything stronger is built on top of it
//! by `gatehost_core`.
//!
//! # Example
//!
//! ```ignore
//! use gatehost_env::{HostContext, NetworkTransport};
//!
//! async fn pump<Ctx: HostContext, Net: NetworkTransport>(ctx: &Ctx, net: &Net) {
//!     while let Some((sender, frame)) = net.recv().await {
//!         handle_frame(sender, frame);
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::HostContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{NodeId, ChannelFrame};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
