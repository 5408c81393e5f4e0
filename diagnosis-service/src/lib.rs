pub mod workflow;

pub use workflow::{ServiceEndpoints, build_coordinator, read_request};
