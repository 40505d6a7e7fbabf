// campus-backup/src/services/mod.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Command;

use crate::config::{ApplicationConfig, HostTask, ServicesConfig};
use crate::errors::AppError;
use crate::utils::{Warnings, find_executable, run_command};

/// OS service manager and host command runner.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn is_active(&self, service: &str) -> bool;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn start(&self, service: &str) -> Result<()>;
    /// Runs a host task to completion and returns its stdout.
    async fn run_task(&self, task: &HostTask) -> Result<String>;
}

/// `systemctl`-driven controller for the local host.
#[derive(Debug, Default, Clone)]
pub struct SystemdController;

impl SystemdController {
    async fn systemctl(&self, action: &'static str, service: &str) -> Result<()> {
        let service = service.to_string();
        tokio::task::spawn_blocking(move || {
            let systemctl = find_executable("systemctl")?;
            run_command(Command::new(systemctl).arg(action).arg(&service))
                .with_context(|| format!("systemctl {} {} failed", action, service))
        })
        .await
        .context("systemctl task panicked")??;
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for SystemdController {
    async fn is_active(&self, service: &str) -> bool {
        let service = service.to_string();
        tokio::task::spawn_blocking(move || {
            Command::new("systemctl")
                .args(["is-active", "--quiet", &service])
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }

    async fn stop(&self, service: &str) -> Result<()> {
        tracing::info!("⏹ Stopping {}", service);
        self.systemctl("stop", service).await
    }

    async fn start(&self, service: &str) -> Result<()> {
        tracing::info!("▶ Starting {}", service);
        self.systemctl("start", service).await
    }

    async fn run_task(&self, task: &HostTask) -> Result<String> {
        let task = task.clone();
        tokio::task::spawn_blocking(move || {
            let mut command = Command::new(&task.program);
            command.args(&task.args);
            if let Some(dir) = &task.working_dir {
                command.current_dir(dir);
            }
            run_command(&mut command).with_context(|| format!("Task '{}' failed", task.name))
        })
        .await
        .context("host task panicked")?
    }
}

/// Services from `names` that are not currently active.
pub async fn inactive_services(control: &dyn ServiceControl, names: &[String]) -> Vec<String> {
    let mut down = Vec::new();
    for name in names {
        if !control.is_active(name).await {
            down.push(name.clone());
        }
    }
    down
}

/// Liveness of every configured service, recorded in backup metadata.
pub async fn snapshot(control: &dyn ServiceControl, services: &ServicesConfig) -> BTreeMap<String, bool> {
    let mut states = BTreeMap::new();
    for name in services.all() {
        let active = control.is_active(&name).await;
        states.insert(name, active);
    }
    states
}

/// Turns on maintenance mode for every application that has a toggle.
pub async fn enter_maintenance(
    control: &dyn ServiceControl,
    apps: &[&ApplicationConfig],
    warnings: &mut Warnings,
) {
    toggle_maintenance(control, apps, true, warnings).await
}

pub async fn exit_maintenance(
    control: &dyn ServiceControl,
    apps: &[&ApplicationConfig],
    warnings: &mut Warnings,
) {
    toggle_maintenance(control, apps, false, warnings).await
}

async fn toggle_maintenance(
    control: &dyn ServiceControl,
    apps: &[&ApplicationConfig],
    enable: bool,
    warnings: &mut Warnings,
) {
    for app in apps {
        let Some(commands) = &app.maintenance else {
            continue;
        };
        let task = if enable { &commands.enable } else { &commands.disable };
        match control.run_task(task).await {
            Ok(_) => tracing::info!(
                "🚧 Maintenance mode {} for {}",
                if enable { "enabled" } else { "disabled" },
                app.store
            ),
            Err(e) => warnings.push(format!(
                "Could not {} maintenance mode for {}: {:#}",
                if enable { "enable" } else { "disable" },
                app.store,
                e
            )),
        }
    }
}

/// Stops services in the given order. Failures are warnings.
pub async fn stop_services(control: &dyn ServiceControl, names: &[String], warnings: &mut Warnings) {
    for name in names {
        if let Err(e) = control.stop(name).await {
            warnings.push(format!("Could not stop {}: {:#}", name, e));
        }
    }
}

/// Order in which services come back after a restore: the data tier first,
/// then the stopped services in reverse stop order.
pub fn start_order(services: &ServicesConfig) -> Vec<String> {
    let mut order = services.database_services.clone();
    for name in services.stop_order.iter().rev() {
        if !order.contains(name) {
            order.push(name.clone());
        }
    }
    order
}

/// Starts services in order. A database service that fails to start (or is
/// not active afterwards) aborts with `ServiceStart`; others are warnings.
pub async fn start_services(
    control: &dyn ServiceControl,
    services: &ServicesConfig,
    names: &[String],
    warnings: &mut Warnings,
) -> crate::errors::Result<()> {
    for name in names {
        let started = match control.start(name).await {
            Ok(()) => {
                if control.is_active(name).await {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("{} is not active after start", name))
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            if services.is_database_service(name) {
                tracing::error!("Database service {} failed to start: {:#}", name, e);
                return Err(AppError::ServiceStart(name.clone()));
            }
            warnings.push(format!("Could not start {}: {:#}", name, e));
        }
    }
    Ok(())
}
