//! Request and Response models for the cache admin API
//!
//! DTOs for the HTTP surface in front of the cache manager.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{MgetRequest, PatternRequest, SetRequest};
pub use responses::{DeleteResponse, GetResponse, InvalidateResponse, MgetResponse, SetResponse};
