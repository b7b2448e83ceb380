//! Container engine adapters.

pub mod docker;
pub mod memory;

pub use docker::DockerContainerRuntime;
pub use memory::InMemoryContainerRuntime;
