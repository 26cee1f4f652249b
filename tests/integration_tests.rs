//! Integration tests for the uptime engine

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/end_to_end.rs"]
mod end_to_end;

#[path = "integration/failure_scenarios.rs"]
mod failure_scenarios;

#[path = "integration/quota_concurrency.rs"]
mod quota_concurrency;

#[cfg(feature = "storage-sqlite")]
#[path = "integration/sqlite_persistence.rs"]
mod sqlite_persistence;
