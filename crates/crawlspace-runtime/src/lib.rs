//! Running crawl probes inside containers, and crawling many containers.
//!
//! The [`executor::IsolatedExecutor`] joins a target's namespaces, forks a
//! short-lived worker that inherits them, runs a probe there, and receives
//! the result over a bounded channel under a wall-clock bound. The
//! [`crawler::Crawler`] drives one crawl cycle over many containers.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod channel;
pub mod crawler;
pub mod executor;
pub mod preload;
pub mod probes;
