//! # deltadex testkit
//!
//! Test utilities for deltadex.
//!
//! This crate provides:
//! - Engine fixtures with a manual clock and a blog-style schema
//! - Property-based test generators using proptest
//! - Fault injection for index builds and segment files
//!
//! ## Usage
//!
//! ```rust,ignore
//! use deltadex_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     let t = TestEngine::memory(DeltaStrategy::Immediate);
//!     t.insert_article(1, "hello", "world");
//!     assert_eq!(t.search_ids("hello"), vec![1]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use deltadex_core::{
        DeltaBuild, DeltaStrategy, Engine, EngineConfig, RecordId, SegmentKind,
    };
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
