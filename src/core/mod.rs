pub mod emit;
pub mod health;
pub mod logger;
pub mod mesh;
pub mod voip;

pub use logger::{LogLevel, Logger};
