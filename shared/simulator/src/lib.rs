pub mod collision;
pub mod config;
pub mod error;
pub mod geometry;
pub mod host;
pub mod input;
pub mod physics;
pub mod progress;
pub mod protest;
pub mod rng;
pub mod rules;
pub mod state;
pub mod wind;
