pub mod config;
pub mod data;
pub mod model;
pub mod parameter;
pub mod prior;
pub mod uncertain;

pub mod errors;

pub use errors::{FitError, FitResult};
