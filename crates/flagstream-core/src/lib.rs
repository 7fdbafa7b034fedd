//! # Flagstream Core
//!
//! This crate provides the data-plane primitives of the Flagstream SDK:
//!
//! - Evaluation contexts and attribute references
//! - The flag/segment data model with its JSON codec and ingest-time
//!   preprocessing (compiled regexes, parsed versions and dates, hashed
//!   key sets)
//! - The pure evaluation engine producing values and structured reasons
//! - The data store contract and the default in-memory store
//!
//! Everything here is synchronous and I/O-free. The companion crates wire it
//! to the outside world: `flagstream-client` runs the data sources, stores,
//! and the client façade, and `flagstream-events` delivers analytics events.
//!
//! ## Example
//!
//! ```rust
//! use flagstream_core::context::Context;
//! use flagstream_core::eval::{DataProvider, Evaluator};
//! use flagstream_core::model::codec;
//! # use std::sync::Arc;
//! # use flagstream_core::model::{Flag, Segment};
//!
//! # struct OneFlag(Arc<Flag>);
//! # impl DataProvider for OneFlag {
//! #     fn flag(&self, _: &str) -> Option<Arc<Flag>> { Some(self.0.clone()) }
//! #     fn segment(&self, _: &str) -> Option<Arc<Segment>> { None }
//! # }
//! let data = codec::parse_all_data(br#"{
//!     "flags": {"greeting": {
//!         "key": "greeting", "version": 1, "on": true,
//!         "variations": [false, true],
//!         "fallthrough": {"variation": 1}, "offVariation": 0, "salt": "x"
//!     }},
//!     "segments": {}
//! }"#).unwrap();
//! let flag = Arc::new(data.flags["greeting"].clone());
//! let provider = OneFlag(flag.clone());
//! let context = Context::builder("user-1").build().unwrap();
//! let detail = Evaluator::new(&provider).evaluate(&flag, &context, None);
//! assert_eq!(detail.value, Some(serde_json::json!(true)));
//! ```

pub mod context;
pub mod error;
pub mod eval;
pub mod model;
pub mod store;

pub use context::{AttributeRef, Context, ContextBuilder, ContextKind, MultiContextBuilder};
pub use error::{FlagstreamError, Result};
pub use eval::{BigSegmentsStatus, Detail, ErrorKind, Evaluator, Reason, ReasonKind};
pub use store::{DataKind, DataStore, MemoryDataStore, StoreItem};

/// Current version of the SDK core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
