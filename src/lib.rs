//! Streaming packet server library.
//!
//! # Architecture Overview
//!
//! ```text
//!   Producer / consumer connections
//!       │
//!       ▼
//!   ┌──────────┐     ┌────────────┐     ┌──────────────┐
//!   │   net    │────▶│  protocol  │────▶│     ring     │
//!   │ listener │     │  handler   │     │    buffer    │
//!   └──────────┘     └────────────┘     └──────────────┘
//!       │                  │                   ▲
//!       │   admission      │ counters,         │ scanner ingest
//!       │   (IP policy)    │ lifecycle         │
//!       ▼                  ▼                   │
//!   ┌────────────────────────────────────────────────────┐
//!   │                 server supervisor                  │
//!   │   tick loop: reap/respawn units, rates, idle       │
//!   │   eviction, transfer log, config reload, shutdown  │
//!   └────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod client;
pub mod config;
pub mod net;
pub mod protocol;
pub mod ring;
pub mod server;

// Ingest and accounting
pub mod scanner;
pub mod transferlog;

// Cross-cutting concerns
pub mod observability;

pub use config::schema::ServerConfig;
pub use server::Server;
