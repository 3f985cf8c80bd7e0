mod builder;
mod engine;
mod error;
pub mod pacer;
pub mod scheduler;
pub mod sketch;

pub use builder::EngineBuilder;
pub use engine::Engine;
pub use error::{Error, Result};
pub use pacer::Pacer;
pub use sketch::FrequencySketch;
