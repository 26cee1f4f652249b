//! Uptime check scheduling and incident tracking
//!
//! This crate is the background engine of a multi-tenant uptime monitoring
//! service. Monitors are created by an external CRUD layer; the engine reads
//! them from a [`storage::MonitorStore`], probes them from every configured
//! region and turns the results into incidents and notifications.
//!
//! ```text
//! SchedulerActor ──enqueue──▶ RegionPool (per region) ──probe──▶ Prober
//!       ▲                            │
//!       │ reconcile                  ▼ ProbeOutcome
//! MonitorStore               IncidentEngine ──▶ IncidentStore / ResultStore
//!                                    │
//!                                    ▼
//!                          NotificationDispatcher ──▶ Notifier
//! ```
//!
//! The [`quota::QuotaGate`] sits beside the pipeline: the CRUD layer asks it
//! before inserting monitors or alert recipients.

pub mod actors;
pub mod config;
pub mod engine;
pub mod incident;
pub mod model;
pub mod notifier;
pub mod prober;
pub mod quota;
pub mod retry;
pub mod storage;
pub mod util;
