pub mod collections;
pub mod macros;
pub mod time;
pub mod time_varying;

pub use time_varying::{TimeError, TimeVarying};
