//! Configuration schema and JSON-backed store

mod schema;
mod store;

pub use schema::{AppConfig, AudioConfig, CameraConfig, StreamConfig};
pub use store::{ConfigChange, ConfigStore};
