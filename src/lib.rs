//! dtab - columnar in-memory data engine.
//!
//! This library provides the core functionality shared between:
//! - the `dtab` CLI - inspect and convert tabular files
//! - embedding applications that read CSV into typed frames
//!
//! The three load-bearing pieces are the column model (`column`), the
//! parallel CSV reader (`read`), and the shared execution runtime
//! (`parallel`) that both run on.

pub mod buffer;
pub mod column;
pub mod error;
pub mod frame;
pub mod jay;
pub mod parallel;
pub mod read;
pub mod util;

pub use error::{DtError, DtResult};
pub use frame::Frame;
pub use read::{FrameIter, ReadOptions, iread, read};
