//! The Rust SDK for AppFlags, a feature flagging platform.
//!
//! # Overview
//!
//! The SDK revolves around an [`AppFlagsClient`] that evaluates feature flag
//! values for users identified by an [`AppFlagsUser`]. Evaluation is
//! delegated to a sandboxed WASM bucketing module; the client's job is to
//! keep a local copy of the server-distributed configuration fresh (periodic
//! polling plus a realtime update stream) and to invoke the module safely.
//!
//! Flag lookups return a [`FlagLookup`], which distinguishes a found value
//! from a missing flag and from a flag of a different type. The
//! `get_*_variation` helpers collapse all of those into a caller-provided
//! default.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! In production, it is recommended to use the `get_*_variation` helpers and
//! sensible defaults, as feature flag evaluation should not be critical
//! enough to cause system crashes. The returned errors are valuable for
//! debugging and usually indicate that developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for
//! logging messages. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod bridge;
mod bucketing;
mod client;
mod config;
mod configuration;
mod configuration_fetcher;
mod configuration_store;
mod error;
mod poller;
mod protocol;
mod realtime;

pub use client::{AppFlagsClient, AppFlagsUser, FlagLookup, FlagValue};
pub use config::ClientConfig;
pub use error::{Error, Result};
