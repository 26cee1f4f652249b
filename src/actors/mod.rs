//! Actor-based check pipeline
//!
//! Each long-lived component runs as an independent async task and is
//! controlled through a cloneable handle wrapping an mpsc command channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!              ┌──────────────────┐
//!              │  SchedulerActor  │  tick (1s) / reconcile (30s)
//!              └────────┬─────────┘
//!                       │ ProbeJob (try_send, bounded)
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!  ┌──────▼──────┐ ┌────▼────────┐ ┌───▼─────────┐
//!  │ RegionPool  │ │ RegionPool  │ │ RegionPool  │  N workers each
//!  │ us-east-1   │ │ eu-west-1   │ │ ...         │
//!  └──────┬──────┘ └────┬────────┘ └───┬─────────┘
//!         │ ProbeOutcome│              │
//!         └─────────────┼──────────────┘
//!                       │
//!              ┌────────▼─────────┐
//!              │  IncidentEngine  │  per-monitor lock
//!              └──────────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **SchedulerActor**: owns the schedule and dispatches due checks
//! - **RegionPool**: bounded queue plus worker tasks for one region
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Jobs**: bounded per-region queues that reject instead of growing
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod messages;
pub mod region_pool;
pub mod scheduler;
