//! Training utilities that work on the whole store rather than on one graph.

pub mod optim;

pub use optim::AdamW;
