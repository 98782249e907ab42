//! Applications with an ordered deployment history and rollback.

use super::{IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs};
use crate::helpers::validate_resource_name;
use crate::testing::Resettable;
use crate::traits::{
    App, AppConfig, CloudError, CloudResult, Deployment, DeploymentRequest, DeploymentStatus,
    HostingIO, ResourceId,
};
use std::collections::BTreeMap;
use tracing::info;

const APP_DOMAIN: &str = "apps.memory";

#[derive(Debug)]
struct HostedApp {
    runtime: String,
    environment: BTreeMap<String, String>,
    created_at: TimestampMs,
    deployments: Vec<Deployment>,
}

impl HostedApp {
    fn app(&self, name: &str) -> App {
        App {
            name: name.to_string(),
            runtime: self.runtime.clone(),
            url: format!("https://{name}.{APP_DOMAIN}"),
            environment: self.environment.clone(),
            active_deployment: self.active().map(|d| d.id.clone()),
            created_at: self.created_at,
        }
    }

    fn active(&self) -> Option<&Deployment> {
        self.deployments
            .iter()
            .rfind(|d| d.status == DeploymentStatus::Active)
    }
}

#[derive(Debug, Default)]
pub struct HostingState {
    apps: BTreeMap<String, HostedApp>,
    ids: IdSequence,
}

impl HostingState {
    fn app_mut(&mut self, name: &str) -> CloudResult<&mut HostedApp> {
        self.apps
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(app_id(name)))
    }
}

fn app_id(name: &str) -> ResourceId {
    ResourceId::new("app", name)
}

#[derive(Clone)]
pub struct FakeHostingIO {
    store: Store<HostingState>,
    env: SimEnv,
}

impl FakeHostingIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<HostingState>, env: SimEnv) -> Self {
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<HostingState> {
        self.store.clone()
    }
}

impl Default for FakeHostingIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeHostingIO {
    fn reset(&self) {
        *self.store.lock() = HostingState::default();
    }
}

impl HostingIO for FakeHostingIO {
    fn create_app(&self, name: &str, config: AppConfig) -> CloudResult<App> {
        validate_resource_name(name)?;
        if config.runtime.is_empty() {
            return Err(CloudError::validation("app runtime is required"));
        }
        let now = self.env.enter("hosting.create_app")?;
        let mut state = self.store.lock();
        if state.apps.contains_key(name) {
            return Err(CloudError::already_exists(app_id(name)));
        }
        let app = HostedApp {
            runtime: config.runtime,
            environment: config.environment,
            created_at: now,
            deployments: Vec::new(),
        };
        let view = app.app(name);
        state.apps.insert(name.to_string(), app);
        info!(app = name, runtime = %view.runtime, "app created");
        Ok(view)
    }

    fn get_app(&self, name: &str) -> CloudResult<App> {
        self.env.enter("hosting.get_app")?;
        let mut state = self.store.lock();
        Ok(state.app_mut(name)?.app(name))
    }

    fn list_apps(&self) -> CloudResult<Vec<App>> {
        self.env.enter("hosting.list_apps")?;
        let state = self.store.lock();
        Ok(state.apps.iter().map(|(name, app)| app.app(name)).collect())
    }

    fn delete_app(&self, name: &str) -> CloudResult<()> {
        self.env.enter("hosting.delete_app")?;
        self.store
            .lock()
            .apps
            .remove(name)
            .ok_or_else(|| CloudError::not_found(app_id(name)))?;
        info!(app = name, "app deleted");
        Ok(())
    }

    fn deploy(&self, app: &str, request: DeploymentRequest) -> CloudResult<Deployment> {
        if request.version.is_empty() || request.artifact.is_empty() {
            return Err(CloudError::validation(
                "deployment version and artifact are required",
            ));
        }
        let now = self.env.enter("hosting.deploy")?;
        let mut state = self.store.lock();
        let HostingState { apps, ids } = &mut *state;
        let target = apps
            .get_mut(app)
            .ok_or_else(|| CloudError::not_found(app_id(app)))?;

        for previous in &mut target.deployments {
            if previous.status == DeploymentStatus::Active {
                previous.status = DeploymentStatus::Superseded;
            }
        }
        let mut environment = target.environment.clone();
        environment.extend(request.environment);
        let deployment = Deployment {
            id: ids.next("deploy"),
            app: app.to_string(),
            version: request.version,
            artifact: request.artifact,
            environment,
            status: DeploymentStatus::Active,
            deployed_at: now,
        };
        target.deployments.push(deployment.clone());
        info!(app, id = %deployment.id, version = %deployment.version, "deployment activated");
        Ok(deployment)
    }

    fn list_deployments(&self, app: &str) -> CloudResult<Vec<Deployment>> {
        self.env.enter("hosting.list_deployments")?;
        let mut state = self.store.lock();
        Ok(state.app_mut(app)?.deployments.clone())
    }

    fn rollback(&self, app: &str) -> CloudResult<Deployment> {
        self.env.enter("hosting.rollback")?;
        let mut state = self.store.lock();
        let target = state.app_mut(app)?;
        let current = target
            .deployments
            .iter()
            .rposition(|d| d.status == DeploymentStatus::Active)
            .ok_or_else(|| {
                CloudError::conflict(format!("app {app} has no active deployment"))
                    .with_resource(app_id(app))
            })?;
        let previous = target.deployments[..current]
            .iter()
            .rposition(|d| d.status == DeploymentStatus::Superseded)
            .ok_or_else(|| {
                CloudError::conflict(format!("app {app} has no earlier deployment to roll back to"))
                    .with_resource(app_id(app))
            })?;

        target.deployments[current].status = DeploymentStatus::RolledBack;
        let restored = &mut target.deployments[previous];
        restored.status = DeploymentStatus::Active;
        info!(app, id = %restored.id, version = %restored.version, "deployment rolled back");
        Ok(restored.clone())
    }
}
