//! Configuration: JSON-backed store and schema

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
