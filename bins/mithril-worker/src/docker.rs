// Container sandbox using Bollard
// One throw-away container per command: the job's working directory is
// bind-mounted read-write, the exercise directory read-only.

use crate::config::SandboxProfile;
use crate::sandbox::{JobMounts, ProcessOutput, Sandbox, SandboxError, SandboxView};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use mithril_common::types::CommandSpec;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CONTAINER_WORKDIR: &str = "/work";
const CONTAINER_EXERCISE_DIR: &str = "/exercise";

/// Container cleanup guard - guarantees container removal on drop, even when
/// the run future is cancelled or times out
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// Docker-backed sandbox
///
/// **Isolation:**
/// - Network disabled
/// - Memory, CPU and process-count limits from the sandbox profile
/// - All capabilities dropped, no privilege escalation
/// - Only the job's working directory is writable
pub struct DockerSandbox {
    docker: Docker,
    profile: SandboxProfile,
}

impl std::fmt::Debug for DockerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox")
            .field("image", &self.profile.image)
            .finish()
    }
}

impl DockerSandbox {
    pub fn connect(profile: SandboxProfile) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Docker(format!("failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker, profile })
    }

    /// Ensure the sandbox image is present, pulling it on a cache miss
    pub async fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = self.profile.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Docker(format!("failed to pull {}: {}", image, e)))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, mounts: &JobMounts, command: &CommandSpec) -> Config<String> {
        let mut cmd = vec![command.program().to_string()];
        cmd.extend(command.args().iter().cloned());

        Config {
            image: Some(self.profile.image.clone()),
            cmd: Some(cmd),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            env: Some(vec![
                format!("HOME={}", CONTAINER_WORKDIR),
                "LANG=C.UTF-8".to_string(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(self.profile.network_disabled),
            host_config: Some(HostConfig {
                binds: Some(vec![
                    format!("{}:{}:rw", mounts.workdir.display(), CONTAINER_WORKDIR),
                    format!("{}:{}:ro", mounts.exercise_dir.display(), CONTAINER_EXERCISE_DIR),
                ]),
                memory: Some(self.profile.memory_limit_bytes()),
                nano_cpus: Some(self.profile.nano_cpus()),
                pids_limit: Some(self.profile.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                network_mode: if self.profile.network_disabled {
                    Some("none".to_string())
                } else {
                    None
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn push_capped(buf: &mut String, chunk: &[u8], limit: usize) {
    if buf.len() >= limit {
        return;
    }
    let text = String::from_utf8_lossy(chunk);
    let room = limit - buf.len();
    if text.len() <= room {
        buf.push_str(&text);
    } else {
        let mut end = room;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        buf.push_str(&text[..end]);
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn view(&self, _mounts: &JobMounts) -> SandboxView {
        SandboxView {
            workdir: CONTAINER_WORKDIR.to_string(),
            exercise_dir: CONTAINER_EXERCISE_DIR.to_string(),
        }
    }

    async fn run(
        &self,
        mounts: &JobMounts,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<ProcessOutput, SandboxError> {
        let container_name = format!("mithril-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(mounts, command))
            .await
            .map_err(|e| SandboxError::Spawn(std::io::Error::other(e.to_string())))?;

        // Set up cleanup immediately after creation
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id.clone(),
        };
        let container_id = container.id.as_str();

        let start = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Spawn(std::io::Error::other(e.to_string())))?;

        let limit = self.profile.output_limit_bytes();
        let execution = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(container_id, logs_options);
            while let Some(output) = logs.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => push_capped(&mut stdout, &message, limit),
                    Ok(LogOutput::StdErr { message }) => push_capped(&mut stderr, &message, limit),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %container_id, error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = Some(WaitContainerOptions {
                condition: "not-running",
            });
            let mut wait = self.docker.wait_container(container_id, wait_options);
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(container_id = %container_id, error = %e, "Failed to read container exit code");
                    None
                }
                None => None,
            };

            (stdout, stderr, exit_code)
        };

        match tokio::time::timeout(timeout, execution).await {
            Ok((stdout, mut stderr, exit_code)) => {
                // 137 = SIGKILL, usually the memory limit
                if exit_code == Some(137) {
                    stderr.push_str("\n[killed: memory limit exceeded]");
                }
                Ok(ProcessOutput {
                    exit_code: exit_code.map(|c| c as i32),
                    stdout,
                    stderr,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(_) => {
                // the guard force-removes the container, which kills it
                Err(SandboxError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }
}
