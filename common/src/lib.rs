//! Types and helpers shared by the camwatch binaries.

pub mod config;
pub mod multipart;
pub mod protocol;
pub mod recordings;
