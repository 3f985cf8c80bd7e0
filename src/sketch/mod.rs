//! Popularity estimation for admission and eviction decisions.

mod frequency;

pub use frequency::{FrequencySketch, MAX_FREQUENCY};
