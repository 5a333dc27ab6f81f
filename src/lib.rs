//! # Tsunagi: Cluster Registry
//!
//! Tsunagi tracks which agent processes are alive, which containers each of
//! them hosts, and which clients lease those containers. It places containers
//! on agents, evicts agents and clients that stop sending heartbeats, reclaims
//! containers nobody uses, and republishes a coalesced stream of lifecycle
//! events to every interested client.
//!
//! ## Components
//!
//! - Tick scheduling ([`ticker`]): a fixed-rate pulse with phase-shifted
//!   periodic handlers and a wait-for-tick primitive.
//! - Container contract ([`container`]): the only view the registry has of a
//!   hosted work unit, plus the per-kind factory that creates one.
//! - Agent side ([`agent_registry`]): containers hosted in this process, with at
//!   most one concurrent start per container id.
//! - Network side ([`network`]): the authoritative agent table, ownership index,
//!   client table, orphan set and event queue.
//!
//! The two sides talk through the traits in [`api`], so a transport can sit in
//! between without either side noticing.
//!
//! ## Placement Flow
//!
//! ```text
//! client ─get─▶ NetworkRegistry ─get─▶ AgentRegistry ─factory─▶ Container
//!    ▲                 │
//!    └──ContainerEvent─┘ (merged once per tick)
//! ```
//!
//! ## Events
//!
//! Structural changes are queued as [`event::ContainerEvent`] batches and merged
//! on every tick, so a container created and destroyed inside one broadcast
//! window is only ever reported as deleted.

pub mod agent_registry;
pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod network;
pub mod ticker;
pub mod types;

// Re-exports
pub use error::*;
pub use event::*;
pub use types::*;
