//! Builds images and runs containers for a deployment.
//!
//! Built over `bollard`, connecting via `Docker::connect_with_unix` /
//! `connect_with_http` plus `API_DEFAULT_VERSION`, with image builds,
//! stats snapshots, demultiplexed log conversion, and idempotent
//! 404-as-success lifecycle calls layered on top of the base client.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::service::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;

use crate::error::{Error, Result};

/// Per-deployment limits handed to the driver, mirroring `PlanLimits`
/// but already resolved to concrete units the driver speaks.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpu_shares: u32,
    pub disk_gb: u32,
}

#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    pub memory_used_mb: f64,
    pub memory_used_pct: f64,
    pub disk_used_gb: f64,
    pub disk_used_pct: f64,
    pub restart_count: i64,
}

#[async_trait]
pub trait ContainerDriver: Send + Sync + 'static {
    /// Builds `workdir`'s `Dockerfile` into an image, streaming build log
    /// lines through `on_log`. Returns the deterministic `image_ref`.
    async fn build_image(
        &self,
        workdir: &Path,
        image_ref: &str,
        on_log: &mut (dyn FnMut(String) + Send),
    ) -> Result<()>;

    /// Starts a container from `image_ref`, publishing `container_port` on
    /// the host, applying `limits`, and injecting `env`. Returns the
    /// container id.
    async fn run_container(
        &self,
        image_ref: &str,
        container_name: &str,
        container_port: u16,
        host_port: u16,
        env: &[(String, String)],
        limits: ResourceLimits,
    ) -> Result<String>;

    /// Stops a running container within `timeout_secs`. A missing
    /// container is not an error — it is already in the desired end state.
    async fn stop(&self, container_ref: &str, timeout_secs: u32) -> Result<()>;

    /// Removes a (stopped) container. Idempotent.
    async fn remove(&self, container_ref: &str) -> Result<()>;

    /// Removes an image. Idempotent; tolerates `image in use` by the caller
    /// retrying once after the container it backs is removed.
    async fn remove_image(&self, image_ref: &str) -> Result<()>;

    /// Returns up to `tail_lines` of combined stdout/stderr, newest last.
    async fn get_logs(&self, container_ref: &str, tail_lines: usize) -> Result<String>;

    /// Reads back the caps the runtime actually applied to `container_ref`,
    /// so Verify can confirm they match what Run asked for.
    async fn get_resource_limits(&self, container_ref: &str) -> Result<ResourceLimits>;

    /// A point-in-time usage snapshot, used by the Quota Gate and the
    /// `/deployments/{id}` status payload.
    async fn get_usage_stats(&self, container_ref: &str, limits: ResourceLimits) -> Result<UsageStats>;

    /// True if the container is currently in the Docker `running` state.
    async fn is_running(&self, container_ref: &str) -> Result<bool>;
}

pub struct BollardDriver {
    docker: Docker,
}

impl BollardDriver {
    pub fn connect(host: &str) -> Result<Self> {
        let docker = if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 60, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_unix(host, 60, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { docker })
    }

    /// True when the underlying bollard error is Docker's 404, meaning the
    /// resource the caller was acting on is already gone.
    fn is_not_found(err: &BollardError) -> bool {
        matches!(
            err,
            BollardError::DockerResponseServerError { status_code: 404, .. }
        )
    }

    fn is_in_use(err: &BollardError) -> bool {
        matches!(
            err,
            BollardError::DockerResponseServerError { status_code: 409, .. }
        )
    }
}

#[async_trait]
impl ContainerDriver for BollardDriver {
    async fn build_image(
        &self,
        workdir: &Path,
        image_ref: &str,
        on_log: &mut (dyn FnMut(String) + Send),
    ) -> Result<()> {
        let context = tar_gz_context(workdir)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image_ref.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(chunk) = stream.next().await {
            let info = chunk?;
            if let Some(stream_line) = info.stream {
                on_log(stream_line);
            }
            if let Some(err) = info.error {
                return Err(Error::Build(err));
            }
        }

        Ok(())
    }

    async fn run_container(
        &self,
        image_ref: &str,
        container_name: &str,
        container_port: u16,
        host_port: u16,
        env: &[(String, String)],
        limits: ResourceLimits,
    ) -> Result<String> {
        let container_port_key = format!("{container_port}/tcp");
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port_key, HashMap::new());

        let mut storage_opt = HashMap::new();
        storage_opt.insert(
            "size".to_string(),
            format!("{}G", limits.disk_gb.max(1)),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some((limits.memory_mb as i64) * 1024 * 1024),
            cpu_shares: Some(limits.cpu_shares as i64),
            // Best-effort: only storage drivers backed by a quota-capable
            // filesystem (e.g. overlay2 + pquota) honor storage_opt; the
            // Driver verifies what the runtime actually accepted rather
            // than assuming this was applied.
            storage_opt: Some(storage_opt),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut labels = HashMap::new();
        labels.insert("wharf.managed".to_string(), "true".to_string());

        let config = Config {
            image: Some(image_ref.to_string()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(labels),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.to_string(),
            platform: None,
        };

        // A stale container from a previous, failed attempt under the same
        // name would otherwise make create_container fail with 409.
        let _ = self.remove_internal(container_name).await;

        let created = self
            .docker
            .create_container(Some(options), config)
            .await?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await?;

        Ok(created.id)
    }

    async fn stop(&self, container_ref: &str, timeout_secs: u32) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: timeout_secs as i64,
        });
        match self.docker.stop_container(container_ref, options).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container_ref: &str) -> Result<()> {
        self.remove_internal(container_ref).await
    }

    async fn remove_image(&self, image_ref: &str) -> Result<()> {
        let options = Some(RemoveImageOptions {
            force: false,
            noparent: false,
        });
        match self.docker.remove_image(image_ref, options, None).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) if Self::is_in_use(&e) => Err(Error::Orphan(format!(
                "image {image_ref} still in use by another container"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_logs(&self, container_ref: &str, tail_lines: usize) -> Result<String> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines.to_string(),
            timestamps: true,
            ..Default::default()
        });

        let mut stream = self.docker.logs(container_ref, options);
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) if Self::is_not_found(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn get_resource_limits(&self, container_ref: &str) -> Result<ResourceLimits> {
        let details = self.docker.inspect_container(container_ref, None).await?;
        let host_config = details.host_config.unwrap_or_default();
        let memory_mb = (host_config.memory.unwrap_or(0) / (1024 * 1024)).max(0) as u32;
        let cpu_shares = host_config.cpu_shares.unwrap_or(0).max(0) as u32;
        let disk_gb = host_config
            .storage_opt
            .as_ref()
            .and_then(|opts| opts.get("size"))
            .and_then(|size| size.trim_end_matches('G').parse::<u32>().ok())
            .unwrap_or(0);
        Ok(ResourceLimits {
            memory_mb,
            cpu_shares,
            disk_gb,
        })
    }

    async fn get_usage_stats(
        &self,
        container_ref: &str,
        limits: ResourceLimits,
    ) -> Result<UsageStats> {
        let mut stream = self.docker.stats(
            container_ref,
            Some(bollard::container::StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        let Some(snapshot) = stream.next().await else {
            return Ok(UsageStats::default());
        };
        let snapshot = snapshot?;

        let used = snapshot.memory_stats.usage.unwrap_or(0) as f64;
        let limit_bytes = snapshot
            .memory_stats
            .limit
            .filter(|&l| l > 0)
            .unwrap_or((limits.memory_mb as u64).max(1) * 1024 * 1024) as f64;

        let details = self
            .docker
            .inspect_container(container_ref, Some(InspectContainerOptions { size: true }))
            .await?;
        let disk_used_bytes = details.size_rw.unwrap_or(0).max(0) as f64;
        let disk_limit_bytes = (limits.disk_gb.max(1) as f64) * 1024.0 * 1024.0 * 1024.0;

        Ok(UsageStats {
            memory_used_mb: used / (1024.0 * 1024.0),
            memory_used_pct: (used / limit_bytes) * 100.0,
            disk_used_gb: disk_used_bytes / (1024.0 * 1024.0 * 1024.0),
            disk_used_pct: (disk_used_bytes / disk_limit_bytes) * 100.0,
            restart_count: details.restart_count.unwrap_or(0),
        })
    }

    async fn is_running(&self, container_ref: &str) -> Result<bool> {
        let details = match self.docker.inspect_container(container_ref, None).await {
            Ok(details) => details,
            Err(e) if Self::is_not_found(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(details
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }
}

impl BollardDriver {
    async fn remove_internal(&self, container_ref: &str) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(container_ref, options).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Packs `workdir` into a gzip-compressed tar archive suitable as a Docker
/// build context, via the standard `tar::Builder` + `flate2::GzEncoder`
/// pairing.
fn tar_gz_context(workdir: &Path) -> Result<Vec<u8>> {
    let enc = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all(".", workdir)?;
    let enc = builder.into_inner()?;
    let bytes = enc.finish()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tar_gz_context_packs_dockerfile() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let archive = tar_gz_context(dir.path()).unwrap();
        assert!(!archive.is_empty());

        let mut decoder = flate2::read::GzDecoder::new(&archive[..]);
        let mut tar_bytes = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut tar_bytes).unwrap();
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
    }
}
