//! HTTP surface for postbox.
//!
//! Producers enqueue mail through `/emails`; operators drive the processor
//! through `/admin/email-processor`. The router is mounted under `/api` by
//! the server binary.

pub mod endpoints;
pub mod extractors;
pub mod middleware;
pub mod response;

pub use endpoints::{health, router};
pub use middleware::AppState;
