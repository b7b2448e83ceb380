//! Port contracts for containerized tool-server orchestration.

mod runtime;

#[cfg(test)]
pub use runtime::MockContainerRuntime;
pub use runtime::{
    ContainerInspection, ContainerRuntime, ContainerRuntimeError, ContainerRuntimeResult,
    ContainerSpec, ContainerSummary, EngineHealth, EngineHealthCheck, ExecAttachment, ExecReader,
    ExecWriter,
};
