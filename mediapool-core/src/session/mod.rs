pub mod registry;

pub use registry::{SessionContainer, SessionRegistry, select_oldest};
