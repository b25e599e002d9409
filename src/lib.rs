//! Mob Director
//!
//! Server-side decision engine for monsters and NPCs: a per-entity behavior
//! state machine, grid line-of-sight and A* pathfinding, group coordination
//! and map population management.
//!
//! # Features
//!
//! - `metrics_endpoint` - Serve Prometheus/JSON metrics from the demo binary (enabled by default)

pub mod config;
pub mod game;
pub mod metrics;
pub mod util;
