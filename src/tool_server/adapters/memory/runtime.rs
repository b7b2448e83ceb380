//! In-memory container engine for lifecycle tests.

use super::tool_process::{ToolProcess, ToolProcessBehaviour};
use crate::tool_server::domain::{ContainerId, SERVER_LABEL, ServerId};
use crate::tool_server::ports::{
    ContainerInspection, ContainerRuntime, ContainerRuntimeError, ContainerRuntimeResult,
    ContainerSpec, ContainerSummary, EngineHealth, ExecAttachment,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// In-memory container engine.
///
/// Containers are records and exec sessions are scripted tool processes
/// served over in-memory pipes. Knobs keyed by image reference inject the
/// engine failures a real deployment can hit. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContainerRuntime {
    state: Arc<RwLock<RuntimeState>>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    local_images: HashSet<String>,
    pull_failures: HashMap<String, String>,
    stalled_images: HashSet<String>,
    unhealthy_images: HashSet<String>,
    crashing_images: HashSet<String>,
    hung_exec_images: HashSet<String>,
    containers: HashMap<ContainerId, FakeContainer>,
    next_container: u64,
    pulls: usize,
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    exit_code: Option<i64>,
    responsive: Arc<AtomicBool>,
    kill: watch::Sender<bool>,
}

impl FakeContainer {
    fn new(spec: ContainerSpec) -> Self {
        let (kill, _) = watch::channel(false);
        Self {
            spec,
            running: false,
            exit_code: None,
            responsive: Arc::new(AtomicBool::new(true)),
            kill,
        }
    }

    fn halt(&mut self) {
        self.running = false;
        if self.exit_code.is_none() {
            self.exit_code = Some(0);
        }
        self.kill.send_replace(true);
    }
}

impl InMemoryContainerRuntime {
    /// Creates an engine with no images and no containers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every pull of `image` fail with `reason`.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn fail_pulls_of(
        &self,
        image: impl Into<String>,
        reason: impl Into<String>,
    ) -> ContainerRuntimeResult<()> {
        self.write()?.pull_failures.insert(image.into(), reason.into());
        Ok(())
    }

    /// Keeps containers of `image` from ever reaching the running state.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn stall_image(&self, image: impl Into<String>) -> ContainerRuntimeResult<()> {
        self.write()?.stalled_images.insert(image.into());
        Ok(())
    }

    /// Makes the engine health check of `image` containers fail.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn report_unhealthy(&self, image: impl Into<String>) -> ContainerRuntimeResult<()> {
        self.write()?.unhealthy_images.insert(image.into());
        Ok(())
    }

    /// Makes tool processes in `image` containers exit before the handshake.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn crash_tool_process(&self, image: impl Into<String>) -> ContainerRuntimeResult<()> {
        self.write()?.crashing_images.insert(image.into());
        Ok(())
    }

    /// Makes exec probes in `image` containers hang without exiting.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn hang_exec_probes(&self, image: impl Into<String>) -> ContainerRuntimeResult<()> {
        self.write()?.hung_exec_images.insert(image.into());
        Ok(())
    }

    /// Controls whether tool processes of `server_id` answer pings.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn set_responsive(&self, server_id: &ServerId, responsive: bool) -> ContainerRuntimeResult<()> {
        let state = self.read()?;
        state
            .containers
            .values()
            .filter(|container| {
                container.spec.labels.get(SERVER_LABEL).map(String::as_str) == Some(server_id.as_str())
            })
            .for_each(|container| container.responsive.store(responsive, Ordering::SeqCst));
        Ok(())
    }

    /// Removes a container behind the manager's back, as an operator would.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn remove_externally(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()> {
        if let Some(mut container) = self.write()?.containers.remove(container_id) {
            container.halt();
        }
        Ok(())
    }

    /// Inserts a running container as if left behind by an earlier process.
    ///
    /// # Errors
    ///
    /// Returns engine errors when lock acquisition fails.
    pub fn seed_container(
        &self,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> ContainerRuntimeResult<ContainerId> {
        let spec = ContainerSpec {
            name: name.into(),
            image: "seeded".to_owned(),
            command: Vec::new(),
            env: BTreeMap::new(),
            labels,
            volumes: Vec::new(),
            health_check: None,
        };
        let mut state = self.write()?;
        let container_id = state.allocate_id()?;
        let mut container = FakeContainer::new(spec);
        container.running = true;
        state.containers.insert(container_id.clone(), container);
        Ok(container_id)
    }

    /// Returns how many image pulls were performed.
    #[must_use]
    pub fn pull_count(&self) -> usize {
        self.state.read().map_or(0, |state| state.pulls)
    }

    /// Returns the identifiers of every existing container, sorted.
    #[must_use]
    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut container_ids: Vec<ContainerId> = self
            .state
            .read()
            .map(|state| state.containers.keys().cloned().collect())
            .unwrap_or_default();
        container_ids.sort_by(|left, right| left.as_str().cmp(right.as_str()));
        container_ids
    }

    /// Returns the containers labeled with `server_id`.
    #[must_use]
    pub fn containers_for(&self, server_id: &ServerId) -> Vec<ContainerId> {
        self.state
            .read()
            .map(|state| {
                state
                    .containers
                    .iter()
                    .filter(|(_, container)| {
                        container.spec.labels.get(SERVER_LABEL).map(String::as_str)
                            == Some(server_id.as_str())
                    })
                    .map(|(container_id, _)| container_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the definition a container was created from.
    #[must_use]
    pub fn spec_of(&self, container_id: &ContainerId) -> Option<ContainerSpec> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.containers.get(container_id).map(|container| container.spec.clone()))
    }

    fn read(&self) -> ContainerRuntimeResult<RwLockReadGuard<'_, RuntimeState>> {
        self.state.read().map_err(poisoned)
    }

    fn write(&self) -> ContainerRuntimeResult<RwLockWriteGuard<'_, RuntimeState>> {
        self.state.write().map_err(poisoned)
    }
}

impl RuntimeState {
    fn allocate_id(&mut self) -> ContainerRuntimeResult<ContainerId> {
        self.next_container = self.next_container.saturating_add(1);
        ContainerId::new(format!("{:012x}{:052x}", self.next_container, self.next_container))
            .map_err(|err| ContainerRuntimeError::engine("create", err))
    }

    fn container(&self, container_id: &ContainerId) -> ContainerRuntimeResult<&FakeContainer> {
        self.containers
            .get(container_id)
            .ok_or_else(|| ContainerRuntimeError::NotFound(container_id.clone()))
    }

    fn running_container(&self, container_id: &ContainerId) -> ContainerRuntimeResult<&FakeContainer> {
        let container = self.container(container_id)?;
        if !container.running {
            return Err(ContainerRuntimeError::Exec {
                container_id: container_id.clone(),
                reason: "container is not running".to_owned(),
            });
        }
        Ok(container)
    }
}

fn poisoned<T>(err: PoisonError<T>) -> ContainerRuntimeError {
    ContainerRuntimeError::engine("state lock", std::io::Error::other(err.to_string()))
}

#[async_trait]
impl ContainerRuntime for InMemoryContainerRuntime {
    async fn ensure_image(&self, image: &str) -> ContainerRuntimeResult<()> {
        let mut state = self.write()?;
        if let Some(reason) = state.pull_failures.get(image) {
            return Err(ContainerRuntimeError::ImagePull {
                image: image.to_owned(),
                reason: reason.clone(),
            });
        }
        if state.local_images.insert(image.to_owned()) {
            state.pulls = state.pulls.saturating_add(1);
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> ContainerRuntimeResult<ContainerId> {
        let mut state = self.write()?;
        if !state.local_images.contains(&spec.image) {
            return Err(ContainerRuntimeError::Create {
                name: spec.name.clone(),
                reason: format!("no such image: {}", spec.image),
            });
        }
        if state
            .containers
            .values()
            .any(|container| container.spec.name == spec.name)
        {
            return Err(ContainerRuntimeError::Create {
                name: spec.name.clone(),
                reason: "container name is already in use".to_owned(),
            });
        }
        let container_id = state.allocate_id()?;
        state
            .containers
            .insert(container_id.clone(), FakeContainer::new(spec.clone()));
        Ok(container_id)
    }

    async fn start_container(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()> {
        let mut state = self.write()?;
        let stalled = state
            .container(container_id)
            .map(|container| state.stalled_images.contains(&container.spec.image))?;
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = !stalled;
        }
        Ok(())
    }

    async fn inspect(
        &self,
        container_id: &ContainerId,
    ) -> ContainerRuntimeResult<ContainerInspection> {
        let state = self.read()?;
        let container = state.container(container_id)?;
        let health = if container.spec.health_check.is_none() {
            EngineHealth::NotConfigured
        } else if state.unhealthy_images.contains(&container.spec.image) {
            EngineHealth::Unhealthy
        } else if container.running {
            EngineHealth::Healthy
        } else {
            EngineHealth::Starting
        };
        Ok(ContainerInspection {
            running: container.running,
            health,
            exit_code: container.exit_code,
        })
    }

    async fn exec_probe(
        &self,
        container_id: &ContainerId,
        _command: &[String],
    ) -> ContainerRuntimeResult<i64> {
        let hangs = {
            let state = self.read()?;
            let container = state.running_container(container_id)?;
            state.hung_exec_images.contains(&container.spec.image)
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(0)
    }

    async fn exec_attach(
        &self,
        container_id: &ContainerId,
        _command: &[String],
    ) -> ContainerRuntimeResult<ExecAttachment> {
        let process = {
            let state = self.read()?;
            let container = state.running_container(container_id)?;
            let behaviour = if state.crashing_images.contains(&container.spec.image) {
                ToolProcessBehaviour::ExitImmediately
            } else {
                ToolProcessBehaviour::Serve
            };
            ToolProcess {
                volumes: container.spec.volumes.clone(),
                behaviour,
                responsive: Arc::clone(&container.responsive),
                kill: container.kill.subscribe(),
            }
        };
        Ok(process.spawn())
    }

    async fn logs(
        &self,
        container_id: &ContainerId,
        tail: usize,
    ) -> ContainerRuntimeResult<Vec<String>> {
        let state = self.read()?;
        let container = state.container(container_id)?;
        let mut lines = vec![format!(
            "container {} created from {}",
            container.spec.name, container.spec.image
        )];
        if container.running {
            lines.push("entrypoint started".to_owned());
        } else {
            lines.push("waiting for dependencies before starting".to_owned());
        }
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn stop(&self, container_id: &ContainerId) -> ContainerRuntimeResult<()> {
        if let Some(container) = self.write()?.containers.get_mut(container_id) {
            container.halt();
        }
        Ok(())
    }

    async fn remove(&self, container_id: &ContainerId, force: bool) -> ContainerRuntimeResult<()> {
        let mut state = self.write()?;
        let Some(container) = state.containers.get(container_id) else {
            return Ok(());
        };
        if container.running && !force {
            return Err(ContainerRuntimeError::engine(
                "remove",
                std::io::Error::other("cannot remove a running container without force"),
            ));
        }
        if let Some(mut removed) = state.containers.remove(container_id) {
            removed.halt();
        }
        Ok(())
    }

    async fn list_by_label(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> ContainerRuntimeResult<Vec<ContainerSummary>> {
        let state = self.read()?;
        let mut summaries: Vec<ContainerSummary> = state
            .containers
            .iter()
            .filter(|(_, container)| {
                labels
                    .iter()
                    .all(|(key, value)| container.spec.labels.get(key) == Some(value))
            })
            .map(|(container_id, container)| ContainerSummary {
                id: container_id.clone(),
                labels: container.spec.labels.clone(),
            })
            .collect();
        summaries.sort_by(|left, right| left.id.as_str().cmp(right.id.as_str()));
        Ok(summaries)
    }
}
