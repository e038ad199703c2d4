//! Rate limiting algorithms, backends and the facade over them.

mod backend;
pub mod distributed;
pub mod local;
mod params;
mod policy;
mod registry;
mod resource;

pub use backend::{Limiter, ResourceLimiter};
pub use policy::PolicySet;
pub use registry::Registry;
pub use resource::{AllowOptions, Entry, FixedWindow, Resource};
