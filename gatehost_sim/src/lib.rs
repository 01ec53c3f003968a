//! Gatehost Deterministic Simulation Harness
//!
//! A controlled environment where one authority and several replicas run
//! real [`gatehost_core::Session`]s in lockstep.
//!
//! # Core Principle: The Reactor Pattern
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances one tick per `SimWorld::step`
//! - **Network**: Central router with per-link loss, latency and partitions
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼──────┐            ┌────▼────┐                       │
//! │  │ Authority │◄──────────►│ Replica │     ...               │
//! │  │  Session  │   Router   │ Session │                       │
//! │  └───────────┘            └─────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gatehost_sim::{SimWorld, SimConfig};
//!
//! let mut world = SimWorld::new(SimConfig {
//!     seed: 42,
//!     num_replicas: 3,
//!     ..Default::default()
//! })?;
//! world.spawn_constructs(8);
//! world.run(120)?;
//! assert!(world.converged());
//! ```

mod context;
mod error;
mod network;
mod world;
pub mod constructs;
pub mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use network::{Directory, NetworkMessage, SimNetwork, SimNetworkController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{RouterStats, SimConfig, SimNode, SimSession, SimWorld};
