//! `abflow` is a client-side experimentation and analytics SDK. Applications
//! embed it to evaluate feature gates, dynamic configs and experiments
//! against a per-request user, and to emit analytics events (including
//! automatic exposure events) to a remote collection endpoint.
//!
//! # Overview
//!
//! The SDK is organized as a set of building blocks around two cores:
//!
//! - the **A/B evaluation core** ([`ab::AbCore`]): a rule engine over
//!   immutable spec snapshots with deterministic hash-bucketed rollouts,
//!   recursive spec-to-spec dependencies, optional sticky assignment, and a
//!   background metadata refresh loop that swaps snapshots atomically;
//! - the **event pipeline**: a bounded channel feeding a single batching
//!   loop that flushes by count, byte size or interval, fanning batches out
//!   to concurrency-limited HTTP senders with retries and a failure
//!   callback.
//!
//! [`Client`] ties the two together: evaluation APIs emit exposure events
//! through the same pipeline as user tracking calls.
//!
//! # Example
//!
//! ```no_run
//! use abflow::{AbConfig, Client, Config, User};
//!
//! # fn main() -> abflow::Result<()> {
//! let config = Config::new().with_ab(AbConfig::new().with_project_secret("secret"));
//! let client = Client::with_config("https://collect.example.com", "source-token", config)?;
//!
//! let user = User::with_login_id("user-1").with_ab_property("plan", "pro");
//! if client.check_feature_gate(&user, "new_checkout")? {
//!     // feature path
//! }
//!
//! client.close();
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod ab;
pub mod hash;
pub mod meta_loader;
pub mod signature;

mod client;
mod config;
mod error;
mod event;
mod http;
mod pipeline;
mod poller_thread;
mod user;

pub use ab::models::{
    AbEnv, AbResult, AbSpec, Condition, MetaEnvelope, Rule, RuleClass, SpecType, VariantParams,
    VARIANT_ID_FAIL, VARIANT_ID_PASS,
};
pub use ab::snapshot::{Snapshot, SnapshotStore};
pub use ab::sticky::{StickyError, StickyHandler};
pub use ab::AbCore;
pub use client::Client;
pub use config::{AbConfig, Config, OnTrackFail, DEFAULT_META_PATH, DEFAULT_TRACK_PATH};
pub use error::{Error, Result};
pub use event::{
    format_ab_property_name, Event, EVENT_AB_IMPRESS, EVENT_IDENTIFY, EVENT_USER_SET,
};
pub use meta_loader::{MetaLoader, SignedHttpMetaLoader};
pub use user::{Properties, User, UserPropertyOpts};
