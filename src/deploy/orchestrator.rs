//! Blue-green deployment of compose applications
//!
//! A deployment pulls every image, creates and starts each service under its
//! transitional name next to the live containers, waits for health checks,
//! then swaps the new containers in by name. Failures before the swap undo
//! the whole batch so the live containers are never touched.

use super::tasks::{BackgroundTasks, TaskGuard};
use super::{DeployConfig, DeployError, DeploymentState};
use crate::auth::{can_manage, Identity};
use crate::compose::naming::{final_name, image_reference, is_valid_name, transitional_name};
use crate::compose::translate::{
    build_host_config, build_network_config, build_process_config, APP_LABEL, OWNER_LABEL,
};
use crate::compose::{ComposeFile, ComposeParser};
use crate::container::{ListFilters, ProcessConfig, RemoveOptions, RuntimeGateway};
use crate::error::DeckhandError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How far a service got in a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStage {
    /// Container created under its transitional name
    Created,
    /// Container running under its transitional name
    Started,
    /// Container renamed to its final name
    Swapped,
}

/// A service container created by a deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployedService {
    /// Service name in the compose file
    pub service: String,
    /// Image, as declared
    pub image: String,
    /// Name the container was created with
    pub transitional_name: String,
    /// Runtime container ID
    pub container_id: String,
    /// Name after a successful swap
    pub final_name: Option<String>,
    /// Lifecycle stage
    pub stage: ServiceStage,
}

impl DeployedService {
    /// Current container name
    pub fn name(&self) -> &str {
        self.final_name.as_deref().unwrap_or(&self.transitional_name)
    }
}

/// Outcome of a completed deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub id: Uuid,
    pub app: String,
    pub state: DeploymentState,
    pub services: Vec<DeployedService>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A deployment in progress
struct Deployment<'a> {
    id: Uuid,
    app: &'a str,
    state: DeploymentState,
    services: BTreeMap<String, DeployedService>,
    started_at: DateTime<Utc>,
}

impl<'a> Deployment<'a> {
    fn new(app: &'a str) -> Self {
        Self {
            id: Uuid::new_v4(),
            app,
            state: DeploymentState::Pending,
            services: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: DeploymentState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );

        info!(
            app = %self.app,
            deployment = %self.id,
            from = %self.state,
            to = %next,
            "Deployment state changed"
        );
        self.state = next;

        if next.is_terminal() {
            let elapsed = Utc::now() - self.started_at;
            info!(
                app = %self.app,
                deployment = %self.id,
                state = %next,
                elapsed_ms = elapsed.num_milliseconds(),
                "Deployment finished"
            );
        }
    }

    fn finish(self) -> DeploymentResult {
        DeploymentResult {
            id: self.id,
            app: self.app.to_string(),
            state: self.state,
            services: self.services.into_values().collect(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Unreachable runtimes are reported as such whatever the step
fn step_error(source: DeckhandError, wrap: impl FnOnce(DeckhandError) -> DeployError) -> DeployError {
    match source {
        DeckhandError::RuntimeUnavailable(message) => DeployError::RuntimeUnavailable(message),
        other => wrap(other),
    }
}

/// A container about to be replaced must belong to `app` and be manageable
/// by `identity`
fn claim(
    app: &str,
    identity: &Identity,
    container: &str,
    labels: &HashMap<String, String>,
) -> Result<(), DeployError> {
    let owner_app = labels.get(APP_LABEL).map(String::as_str).unwrap_or_default();
    if owner_app != app {
        return Err(DeployError::NameConflict {
            container: container.to_string(),
            owner_app: owner_app.to_string(),
        });
    }

    if !can_manage(identity, labels) {
        return Err(DeployError::Forbidden {
            app: app.to_string(),
            owner: labels.get(OWNER_LABEL).cloned().unwrap_or_default(),
        });
    }

    Ok(())
}

/// Deploys compose applications against a container runtime
pub struct Deployer {
    gateway: Arc<dyn RuntimeGateway>,
    tasks: Arc<BackgroundTasks>,
    config: DeployConfig,
}

impl Deployer {
    /// Create a deployer
    pub fn new(
        gateway: Arc<dyn RuntimeGateway>,
        tasks: Arc<BackgroundTasks>,
        config: DeployConfig,
    ) -> Self {
        Self {
            gateway,
            tasks,
            config,
        }
    }

    /// Registry deployments register in
    pub fn tasks(&self) -> &Arc<BackgroundTasks> {
        &self.tasks
    }

    /// Register a deployment of `app` in the task registry
    ///
    /// The deployment stays registered until the guard is dropped.
    pub fn register(&self, app: &str) -> Result<TaskGuard, DeployError> {
        if !is_valid_name(app) {
            return Err(DeployError::InvalidCompose(format!(
                "Invalid application name '{}'",
                app
            )));
        }

        self.tasks
            .try_begin(app)
            .ok_or_else(|| DeployError::InProgress(app.to_string()))
    }

    /// Deploy every service of `compose` as application `app`
    pub async fn deploy(
        &self,
        app: &str,
        compose: &ComposeFile,
        identity: &Identity,
    ) -> Result<DeploymentResult, DeployError> {
        let guard = self.register(app)?;
        self.deploy_registered(guard, compose, identity).await
    }

    /// Deploy `compose` as the application `guard` was registered for
    pub async fn deploy_registered(
        &self,
        guard: TaskGuard,
        compose: &ComposeFile,
        identity: &Identity,
    ) -> Result<DeploymentResult, DeployError> {
        let app = guard.key();
        ComposeParser::validate(compose)?;

        self.check_ownership(app, identity).await?;
        self.check_names(app, compose, identity).await?;

        // Translation is pure, reject bad health checks before touching the runtime
        let mut configs = BTreeMap::new();
        for (name, service) in &compose.services {
            configs.insert(name.as_str(), build_process_config(service, identity, app)?);
        }

        let mut deployment = Deployment::new(app);
        info!(
            app,
            deployment = %deployment.id,
            user = %identity.username,
            services = compose.services.len(),
            "Deploying application"
        );

        deployment.transition(DeploymentState::Pulling);
        if let Err(e) = self.pull_images(compose).await {
            return Err(self.abort(&mut deployment, e).await);
        }

        deployment.transition(DeploymentState::Starting);
        if let Err(e) = self.start_services(&mut deployment, compose, &configs).await {
            return Err(self.abort(&mut deployment, e).await);
        }
        if let Err(e) = self.wait_healthy(&deployment, &configs).await {
            return Err(self.abort(&mut deployment, e).await);
        }

        deployment.transition(DeploymentState::Swapping);
        if let Err(e) = self.swap(&mut deployment, identity).await {
            error!(app, deployment = %deployment.id, error = %e, "Deployment partially swapped");
            return Err(e);
        }
        self.cleanup(&deployment).await;

        deployment.transition(DeploymentState::Completed);
        Ok(deployment.finish())
    }

    /// Existing containers of the app must belong to the deploying user
    async fn check_ownership(&self, app: &str, identity: &Identity) -> Result<(), DeployError> {
        if identity.is_admin() {
            return Ok(());
        }

        let containers = self
            .gateway
            .list_containers(&ListFilters::none().label(APP_LABEL, app))
            .await?;

        for container in containers {
            if let Some(owner) = container.labels.get(OWNER_LABEL) {
                if owner != &identity.username {
                    return Err(DeployError::Forbidden {
                        app: app.to_string(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Every name the deployment will create or replace must be free or
    /// already held by this app
    ///
    /// Names are `<app>_<service>`, so `x` + `y_web` and `x_y` + `web` both
    /// map to `x_y_web`.
    async fn check_names(
        &self,
        app: &str,
        compose: &ComposeFile,
        identity: &Identity,
    ) -> Result<(), DeployError> {
        for service in compose.services.keys() {
            let transitional = transitional_name(app, service);

            for name in [final_name(&transitional), transitional] {
                match self.gateway.inspect_container(&name).await {
                    Ok(existing) => claim(app, identity, &name, existing.labels())?,
                    Err(DeckhandError::ContainerNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(())
    }

    async fn pull_images(&self, compose: &ComposeFile) -> Result<(), DeployError> {
        let mut pulled = HashSet::new();

        for service in compose.services.values() {
            let image = image_reference(&service.image);
            if !pulled.insert(image.clone()) {
                continue;
            }

            info!(image = %image, "Pulling image");
            self.gateway
                .pull_image(&image)
                .await
                .map_err(|e| step_error(e, |source| DeployError::Pull { image, source }))?;
        }

        Ok(())
    }

    async fn start_services(
        &self,
        deployment: &mut Deployment<'_>,
        compose: &ComposeFile,
        configs: &BTreeMap<&str, ProcessConfig>,
    ) -> Result<(), DeployError> {
        for (name, service) in &compose.services {
            let container = transitional_name(deployment.app, name);
            let create_error = |source: DeckhandError| DeployError::Create {
                container: container.clone(),
                source,
            };

            self.remove_stale(&container)
                .await
                .map_err(|e| step_error(e, create_error))?;

            let host = build_host_config(service);
            let network = build_network_config(service, &deployment.services);
            let config = configs
                .get(name.as_str())
                .ok_or_else(|| DeployError::InvalidCompose(format!("Unknown service {}", name)))?;

            let id = self
                .gateway
                .create_container(&container, config, &host, &network)
                .await
                .map_err(|e| step_error(e, create_error))?;
            debug!(app = %deployment.app, service = %name, container = %container, id = %id, "Container created");

            deployment.services.insert(
                name.clone(),
                DeployedService {
                    service: name.clone(),
                    image: service.image.clone(),
                    transitional_name: container.clone(),
                    container_id: id.clone(),
                    final_name: None,
                    stage: ServiceStage::Created,
                },
            );

            self.gateway.start_container(&id).await.map_err(|e| {
                step_error(e, |source| DeployError::Start {
                    container: container.clone(),
                    source,
                })
            })?;

            if let Some(record) = deployment.services.get_mut(name) {
                record.stage = ServiceStage::Started;
            }
            info!(app = %deployment.app, service = %name, container = %container, "Container started");
        }

        Ok(())
    }

    /// Remove a container left over by an interrupted deployment
    async fn remove_stale(&self, name: &str) -> Result<(), DeckhandError> {
        match self
            .gateway
            .remove_container(name, RemoveOptions::forced())
            .await
        {
            Ok(()) => {
                warn!(container = %name, "Removed stale container");
                Ok(())
            }
            Err(DeckhandError::ContainerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_healthy(
        &self,
        deployment: &Deployment<'_>,
        configs: &BTreeMap<&str, ProcessConfig>,
    ) -> Result<(), DeployError> {
        let deadline = Instant::now() + self.config.deploy_timeout;

        for record in deployment.services.values() {
            let checked = configs
                .get(record.service.as_str())
                .is_some_and(|config| config.healthcheck.is_some());
            if checked {
                self.wait_container_healthy(record, deadline).await?;
            }
        }

        Ok(())
    }

    async fn wait_container_healthy(
        &self,
        record: &DeployedService,
        deadline: Instant,
    ) -> Result<(), DeployError> {
        let unhealthy = |reason: String| DeployError::Unhealthy {
            container: record.transitional_name.clone(),
            reason,
        };

        loop {
            let details = self
                .gateway
                .inspect_container(&record.container_id)
                .await
                .map_err(|e| step_error(e, |source| unhealthy(source.to_string())))?;

            if !details.state.running {
                return Err(unhealthy(format!("container is {}", details.state.status)));
            }

            match details.health_status() {
                Some("healthy") => {
                    info!(container = %record.transitional_name, "Container is healthy");
                    return Ok(());
                }
                Some("unhealthy") => return Err(unhealthy("health check failed".to_string())),
                status => debug!(container = %record.transitional_name, ?status, "Waiting for health check"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(unhealthy(format!(
                    "not healthy after {:?}",
                    self.config.deploy_timeout
                )));
            }
            tokio::time::sleep(self.config.health_poll_interval.min(deadline - now)).await;
        }
    }

    /// Rename every new container over the live one
    ///
    /// Stops at the first failure; services already swapped stay swapped.
    async fn swap(
        &self,
        deployment: &mut Deployment<'_>,
        identity: &Identity,
    ) -> Result<(), DeployError> {
        let app = deployment.app;
        let mut swapped = Vec::new();

        for (service, record) in deployment.services.iter_mut() {
            let target = final_name(&record.transitional_name);

            if let Err(source) = self.replace(app, identity, &target, record).await {
                return Err(DeployError::Swap {
                    service: service.clone(),
                    swapped,
                    source,
                });
            }

            info!(app = %deployment.app, service = %service, container = %target, "Container swapped");
            record.final_name = Some(target);
            record.stage = ServiceStage::Swapped;
            swapped.push(service.clone());
        }

        Ok(())
    }

    async fn replace(
        &self,
        app: &str,
        identity: &Identity,
        target: &str,
        record: &DeployedService,
    ) -> Result<(), DeckhandError> {
        match self.gateway.inspect_container(target).await {
            Ok(previous) => {
                // The name may have been taken since the deployment started
                if let Err(e) = claim(app, identity, target, previous.labels()) {
                    return Err(DeckhandError::Forbidden(e.to_string()));
                }

                if let Err(e) = self.gateway.stop_container(&previous.id).await {
                    warn!(container = %target, error = %e, "Failed to stop previous container");
                }
                self.gateway
                    .remove_container(&previous.id, RemoveOptions::forced())
                    .await?;

                let previous_image = image_reference(&previous.config.image);
                if previous_image != image_reference(&record.image) {
                    if let Err(e) = self.gateway.remove_image(&previous_image).await {
                        debug!(image = %previous_image, error = %e, "Previous image kept");
                    }
                }
            }
            Err(DeckhandError::ContainerNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.gateway
            .rename_container(&record.container_id, target)
            .await
    }

    /// Remove containers of services the app no longer declares
    async fn cleanup(&self, deployment: &Deployment<'_>) {
        let current: HashSet<&str> = deployment.services.values().map(|r| r.name()).collect();

        let containers = match self
            .gateway
            .list_containers(&ListFilters::none().label(APP_LABEL, deployment.app))
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                warn!(app = %deployment.app, error = %e, "Failed to list retired containers");
                return;
            }
        };

        for container in containers {
            if current.contains(container.name()) {
                continue;
            }

            info!(app = %deployment.app, container = %container.name(), "Removing retired container");
            if let Err(e) = self
                .gateway
                .remove_container(&container.id, RemoveOptions::forced())
                .await
            {
                warn!(container = %container.name(), error = %e, "Failed to remove retired container");
            }
        }
    }

    async fn abort(&self, deployment: &mut Deployment<'_>, cause: DeployError) -> DeployError {
        warn!(app = %deployment.app, deployment = %deployment.id, error = %cause, "Rolling back deployment");
        self.rollback(deployment).await;
        deployment.transition(DeploymentState::RolledBack);
        cause
    }

    /// Undo every container of the batch, newest first
    ///
    /// Failures here are logged and never replace the original error.
    async fn rollback(&self, deployment: &mut Deployment<'_>) {
        while let Some((service, record)) = deployment.services.pop_last() {
            if record.stage == ServiceStage::Started {
                if let Err(e) = self.gateway.stop_container(&record.container_id).await {
                    warn!(service = %service, container = %record.transitional_name, error = %e, "Failed to stop container");
                }
            }

            if let Err(e) = self
                .gateway
                .remove_container(&record.container_id, RemoveOptions::forced())
                .await
            {
                warn!(service = %service, container = %record.transitional_name, error = %e, "Failed to remove container");
            }

            let image = image_reference(&record.image);
            if let Err(e) = self.gateway.remove_image(&image).await {
                debug!(image = %image, error = %e, "Image kept");
            }
        }
    }
}
