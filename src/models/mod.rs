//! Data models for the Schoolbook sync layer.
//!
//! Serialized field names match the browser UI's record shape (camelCase).

mod config;
mod datastore;
mod notification;
mod record;

pub use config::*;
pub use datastore::*;
pub use notification::*;
pub use record::*;
