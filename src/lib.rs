//! Offline-first cache and background sync engine for progressive web apps.
//!
//! The [`worker`] module is the service worker: it routes intercepted
//! requests to caching strategies over named cache partitions ([`cache`]),
//! replays the durable queue of pending operations ([`db`], [`queue`])
//! against the sync endpoint, and handles push, notification and page
//! messages. [`page`] holds the page-side half of that conversation.

pub mod cache;
pub mod config;
pub mod db;
pub mod net;
pub mod page;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;
