//! Auxiliary service containers
//!
//! Persistent services have a stable name and outlive a run. Fresh services carry a
//! random per-run suffix, auto-remove on stop and live for one `run_command` call.

use crate::client::{absorb, find_container, stop_and_remove, ContainerRequest};
use crate::reconcile::Environment;
use iso_foundation::naming::labels;
use iso_foundation::{Result, ServiceSpec};
use tracing::{debug, info, warn};

impl Environment {
    /// Whether every declared service is running under its stable name
    pub async fn persistent_services_running(&self) -> Result<bool> {
        if !self.descriptors.has_services() {
            return Ok(false);
        }
        for name in self.descriptors.services.keys() {
            let container = self.naming.service_container(name);
            match find_container(self.client.as_ref(), &container).await? {
                Some(c) if c.state.is_running() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Start every declared service persistently
    pub async fn start_all_services(&self) -> Result<()> {
        if !self.descriptors.has_services() {
            return Ok(());
        }
        self.ensure_network().await?;
        for (name, spec) in &self.descriptors.services {
            debug!("Starting service {}", name);
            self.start_service(name, spec).await?;
        }
        Ok(())
    }

    /// Running persistent service container id: reuse, restart or create
    pub async fn start_service(&self, name: &str, spec: &ServiceSpec) -> Result<String> {
        let container = self.naming.service_container(name);
        match find_container(self.client.as_ref(), &container).await? {
            Some(c) if c.state.is_running() => Ok(c.id),
            Some(c) => {
                absorb(self.client.start_container(&c.id).await)?;
                Ok(c.id)
            }
            None => {
                self.ensure_service_image(&spec.image).await?;
                let request = self.service_request(name, spec, container, false);
                self.start_container(&request).await
            }
        }
    }

    /// Stop and remove persistent services, then the session network
    pub async fn stop_all_services(&self) -> Result<()> {
        let mut removed = false;
        for name in self.descriptors.services.keys() {
            let container = self.naming.service_container(name);
            if let Some(c) = find_container(self.client.as_ref(), &container).await? {
                stop_and_remove(self.client.as_ref(), &c.id, self.settings.stop_timeout).await?;
                removed = true;
            }
        }
        if removed {
            tokio::time::sleep(self.settings.network_settle_delay).await;
        }
        self.remove_network_quietly(&self.naming.network()).await;
        Ok(())
    }

    /// Start one fresh instance of every service; ids are pushed as containers are created
    /// so the caller can clean up after a partial failure
    pub async fn start_fresh_services(&self, run_id: &str, started: &mut Vec<String>) -> Result<()> {
        self.ensure_network().await?;
        for (name, spec) in &self.descriptors.services {
            self.ensure_service_image(&spec.image).await?;

            let container = self.naming.fresh_service_container(name, run_id);
            let request = self.service_request(name, spec, container, true);
            let id = self.create_container(&request).await?;
            started.push(id.clone());
            self.client.start_container(&id).await?;
            debug!("Fresh service {} started as {}", name, request.name);
        }
        Ok(())
    }

    /// Best-effort teardown of fresh services
    pub async fn stop_fresh_services(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = stop_and_remove(self.client.as_ref(), id, self.settings.fast_stop_timeout).await {
                warn!("Failed to stop fresh service {}: {}", id, e);
            }
        }
    }

    async fn ensure_service_image(&self, image: &str) -> Result<()> {
        if !self.client.image_exists(image).await? {
            info!("Pulling image {}", image);
            self.client.pull_image(image).await?;
        }
        Ok(())
    }

    fn service_request(
        &self,
        name: &str,
        spec: &ServiceSpec,
        container: String,
        fresh: bool,
    ) -> ContainerRequest {
        let mut service_labels = self.base_labels(name);
        service_labels.insert(labels::SERVICE.to_string(), labels::TRUE.to_string());
        service_labels.insert(labels::SERVICE_NAME.to_string(), name.to_string());
        if fresh {
            service_labels.insert(labels::FRESH.to_string(), labels::TRUE.to_string());
        }

        ContainerRequest {
            name: container,
            image: spec.image.clone(),
            cmd: spec.command.clone(),
            env: spec
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels: service_labels,
            network: Some(self.naming.network()),
            aliases: vec![name.to_string()],
            auto_remove: fresh,
            extra_hosts: spec.extra_hosts.clone(),
            ..Default::default()
        }
    }
}
