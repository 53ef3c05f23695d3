//! Focusgate - A timed access gate for distracting websites.
//!
//! Focusgate keeps a configured set of domains blocked and lets the user
//! open a temporary hole in the block: a timed bypass that closes itself
//! after a chosen number of minutes (with a warning shortly before), or an
//! emergency bypass that stays open until cancelled or the daemon restarts.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`directory`]: Protected domains and their rule ids
//! - [`controller`]: The per-domain bypass state machine
//! - [`gateway`]: Network rule toggling
//! - [`store`]: Durable bypass records
//! - [`scheduler`]: Warning and expiry wake-ups
//! - [`protocol`] / [`server`]: JSON control protocol over TCP
//! - [`error`]: Error types
//!
//! # Testing
//!
//! The controller only depends on traits for its side effects, so it can be
//! driven entirely in memory:
//!
//! ```rust
//! use focusgate::directory::RuleDirectory;
//! use focusgate::gateway::RuleTable;
//!
//! let directory = RuleDirectory::new(["youtube.com"]).unwrap();
//! let rules = RuleTable::from_directory(&directory);
//! assert!(rules.is_blocked("m.youtube.com"));
//! ```

pub mod clock;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod notifier;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
