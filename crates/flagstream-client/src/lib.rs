//! # Flagstream Client
//!
//! The server-side Flagstream SDK client: mirror the flag/segment dataset
//! published by the flag delivery service, evaluate flags in-process with
//! sub-millisecond latency, and report usage as batched analytics events.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use flagstream_client::{Client, Config};
//! use flagstream_core::context::Context;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder("your-sdk-key").build()?;
//! let client = Client::new(config).await?;
//!
//! let context = Context::builder("user-42").name("Ada").build()?;
//! if client.bool_variation(&context, "new-checkout", false) {
//!     // serve the new checkout
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - A **data source** (streaming by default, polling or external-updates
//!   as alternatives) keeps the local **data store** eventually consistent
//!   with the service, reporting through an observable state machine.
//! - **Evaluation** (`flagstream-core`) reads store snapshots; it never
//!   performs I/O beyond the store and optional big-segment lookups.
//! - The **event pipeline** (`flagstream-events`) batches usage analytics
//!   without ever blocking an application thread.
//! - **Big segments** and **persistent stores** are pluggable through the
//!   [`big_segments::BigSegmentStore`] and [`store::PersistentDataStore`]
//!   traits.

pub mod all_flags;
pub mod big_segments;
pub mod client;
pub mod config;
pub mod data_source;
pub mod flag_tracker;
pub mod store;

mod http;

pub use all_flags::{AllFlagsOptions, AllFlagsState};
pub use client::{Client, FlagDetail};
pub use config::{
    ApplicationInfo, Config, ConfigBuilder, DataSourceMode, ServiceEndpoints, StoreMode,
    WrapperInfo,
};
pub use data_source::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus,
    DataSourceStatusProvider,
};
pub use flag_tracker::{FlagChange, FlagTracker, FlagValueChange};

pub use flagstream_core::context::{Context, ContextBuilder, ContextKind, MultiContextBuilder};
pub use flagstream_core::eval::{BigSegmentsStatus, ErrorKind, Reason, ReasonKind};
pub use flagstream_core::error::{FlagstreamError, Result};

/// Current version of the SDK.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
