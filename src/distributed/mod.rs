//! Task scheduling across crawl workers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        DistributedCrawlManager           │
//! │  priority queue ─┐                       │
//! │  worker registry ┴─> assignment loop ──┐ │
//! │  results, durations    metrics loop    │ │
//! └────────────────────────────────────────┼─┘
//!              ^ heartbeats, results       │ TaskDispatcher
//!              │                           v
//!        ┌─────┴──────┐              ┌────────────┐
//!        │ CrawlWorker│ ...          │ CrawlWorker│
//!        └────────────┘              └────────────┘
//! ```
//!
//! [`LocalCluster`] wires a manager and its workers together in one process;
//! the [`coordinator`](crate::coordinator) exposes the same manager over HTTP.

pub mod local;
pub mod manager;
pub mod worker;

pub use local::{ChannelDispatcher, LocalCluster};
pub use manager::{Delivery, DistributedCrawlManager, TaskDispatcher};
pub use worker::{CrawlWorker, HeartbeatCallback};
