//! # vmfleet Common
//!
//! Shared utilities for the vmfleet crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! vmfleet_common::init_logging("info")?;
//! ```
//!
//! ## Progress
//!
//! [`Spinner::wrap`] draws a terminal spinner while a long operation runs
//! and tears it down when the operation finishes or Ctrl-C is pressed:
//!
//! ```rust,ignore
//! let uploaded = vmfleet_common::Spinner::wrap("uploading image", upload()).await?;
//! ```

pub mod logging;
pub mod progress;

pub use logging::{init_logging, init_logging_json, LogFormat};
pub use progress::Spinner;
