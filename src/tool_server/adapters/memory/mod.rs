//! In-memory engine double with a scripted tool process.

mod runtime;
mod tool_process;

pub use runtime::InMemoryContainerRuntime;
