pub mod adamw;

pub use adamw::AdamW;
