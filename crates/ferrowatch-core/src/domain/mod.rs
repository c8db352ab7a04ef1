//! # Domain Types
//!
//! Keys and timestamps shared by every ferrowatch component.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SubjectKey`] | Entity a cached fact is about (`user:42`) |
//! | [`FieldKind`] | Tracked attribute of a subject |
//! | [`UtcDateTime`] | UTC timestamp |

mod subject;
mod timestamp;

pub use subject::{FieldKind, SubjectKey, SubjectScope};
pub use timestamp::UtcDateTime;
