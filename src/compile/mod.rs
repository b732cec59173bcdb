pub mod api;
pub mod artifact;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod sandbox;
pub mod toolchain;
pub mod worker;
