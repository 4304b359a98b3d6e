pub mod checkpoint;
pub mod common;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod metrics;
pub mod model;
pub mod params;
pub mod trainer;
