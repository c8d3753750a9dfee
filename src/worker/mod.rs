//! Worker Process, Supervisor and Pool (§4.2-4.3): a fixed-size set of
//! supervised child OS processes, each running one [`crate::sandbox`]
//! kernel, communicating with the primary over newline-delimited JSON.

pub mod child_bridge;
pub mod pool;
pub mod protocol;
pub mod supervisor;
