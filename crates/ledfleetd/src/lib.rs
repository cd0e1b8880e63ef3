//! ledfleet engine - LED pixel distribution to networked controllers
//!
//! This crate renders site pixel buffers at a fixed frame rate and streams
//! them to LED controller devices over TCP:
//! - `scheduler` - Per-site render loop and producer selection
//! - `channel` - Per-device frame queue and batching sender
//! - `connection` - Device socket lifecycle and status responses
//! - `registry` - One shared connection per device hostname
//! - `engine` - Builds and runs the whole fleet from configuration
//! - `monitor` - Periodic snapshot logging and status file output
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ledfleetd                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────────┐   segment   ┌───────────────┐             │
//! │  │ SiteScheduler │────────────▶│ DeviceChannel │ (per strip) │
//! │  │ (per site)    │  enqueue    │ ArrayQueue    │             │
//! │  └───────┬───────┘             └───────┬───────┘             │
//! │          │ render                      │ batch + send        │
//! │          ▼                             ▼                     │
//! │  ┌───────────────┐             ┌───────────────────┐         │
//! │  │ FrameProducer │             │   FleetRegistry   │         │
//! │  │ (scheduled)   │             │ host ─▶ Device-   │──▶ TCP  │
//! │  └───────────────┘             │        Connection │         │
//! │                                └───────────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Schedulers and channel workers run on dedicated OS threads so blocking
//! socket writes never stall rendering. The async runtime only hosts the
//! monitor and signal handling.
//!
//! # Panic-Free Guarantees
//!
//! Production code avoids `.unwrap()` and `.expect()`. Producer panics are
//! caught at the render boundary and reported through telemetry.

pub mod channel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod monitor;
pub mod producers;
pub mod registry;
pub mod scheduler;
pub mod telemetry;
