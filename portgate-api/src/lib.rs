//! JSON-over-HTTP control plane for the rule table

pub mod routes;
pub mod server;

pub use routes::{dispatch, route, Route};
pub use server::{ApiState, ManagementApi};
