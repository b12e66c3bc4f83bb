//! Request middleware: admission control and request logging.

pub mod admission;
pub mod logging;

pub use admission::{admission_guard, AdmissionController};
pub use logging::request_logging;
