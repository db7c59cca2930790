//! pgwarden - PostgreSQL monitoring core.
//!
//! Polls monitored PostgreSQL targets for resource metrics, keeps a rolling
//! window of samples and runs ad-hoc SQL against targets on request.

pub mod clock;
pub mod collector;
pub mod config;
pub mod db;
pub mod query;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod target;
