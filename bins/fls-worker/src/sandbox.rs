//! Sandboxed build and grade containers.
//!
//! The builder is a long-lived, locked-down container that we exec into:
//! once to build, once to stream the bootable image back out. The grader
//! is a one-shot container that gets the image bind-mounted at `/dist`.
//!
//! Anything that stops us from running a container is an infrastructure
//! fault. A container that runs and exits non-zero is the student's.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerWaitResponse, HostConfig};
use bollard::Docker;
use fls_common::config::PullPolicy;
use fls_common::SandboxConfig;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::joblog::JobLog;
use crate::paths::PathTranslator;

pub const ARTIFACT_NAME: &str = "bootable.img";
const BUILD_SCRIPT: &str = "rsync -a --delete /src/ /writable_src/ && exec /build-all-stages.sh";
const NO_NEW_PRIVILEGES: &str = "no-new-privileges";

/// Build and grade a staged submission
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Check that the engine is reachable and both images are present.
    async fn prepare(&self) -> Result<()>;

    /// Build `src_dir`, leaving the bootable image in `out_dir`.
    async fn build(&self, src_dir: &Path, out_dir: &Path, log: &mut JobLog) -> Result<PathBuf>;

    /// Grade an image produced by [`Sandbox::build`].
    async fn grade(&self, artifact: &Path, log: &mut JobLog) -> Result<()>;
}

pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    paths: PathTranslator,
}

impl DockerSandbox {
    pub fn connect(config: &SandboxConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| WorkerError::engine("connect", e))?;
        Ok(Self {
            docker,
            config: config.clone(),
            paths: PathTranslator::from_config(config),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let present = self.docker.inspect_image(image).await.is_ok();
        if present && self.config.pull_policy == PullPolicy::Missing {
            return Ok(());
        }

        match self.pull(image).await {
            Ok(()) => Ok(()),
            Err(e) if present => {
                warn!(image, error = %e, "pull failed, using local copy");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = std::pin::pin!(self.docker.create_image(options, None, None));
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| WorkerError::engine("pull image", e))?;
        }
        Ok(())
    }

    async fn create_and_start(&self, prefix: &str, config: Config<String>) -> Result<String> {
        let name = format!("{}-{}", prefix, uuid::Uuid::new_v4());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| WorkerError::engine("create container", e))?;
        debug!(container = %name, id = %created.id, "container created");

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&created.id).await;
            return Err(WorkerError::engine("start container", e));
        }

        Ok(created.id)
    }

    async fn remove_container(&self, id: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(e) = self.docker.remove_container(id, options).await {
            warn!(container = id, error = %e, "failed to remove container");
        }
    }

    /// Run `cmd` in a running container, returning its output stream and exec id.
    async fn exec(
        &self,
        container: &str,
        cmd: Vec<String>,
    ) -> Result<(
        String,
        std::pin::Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, DockerError>> + Send>>,
    )> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| WorkerError::engine("create exec", e))?;

        match self.docker.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { output, .. }) => Ok((exec.id, output)),
            Ok(StartExecResults::Detached) => Err(WorkerError::Unexpected(
                "exec started detached".to_string(),
            )),
            Err(e) => Err(WorkerError::engine("start exec", e)),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| WorkerError::engine("inspect exec", e))?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn run_build(&self, container: &str, out_dir: &Path, log: &mut JobLog) -> Result<PathBuf> {
        info!("running build script");
        let (exec_id, output) = self
            .exec(container, shell(BUILD_SCRIPT))
            .await?;
        pump_output(output, log).await?;
        build_exit(self.exec_exit_code(&exec_id).await?)?;

        info!("extracting bootable image");
        let artifact = out_dir.join(ARTIFACT_NAME);
        let (exec_id, output) = self
            .exec(container, shell(&format!("exec cat /dist/{}", ARTIFACT_NAME)))
            .await?;
        let copied = copy_capped(output, &artifact, self.config.max_artifact_bytes, log).await?;

        if let Err(e) = artifact_exit(self.exec_exit_code(&exec_id).await?) {
            let _ = tokio::fs::remove_file(&artifact).await;
            return Err(e);
        }

        info!(bytes = copied, "bootable image extracted");
        Ok(artifact)
    }

    async fn run_grade(&self, container: &str, log: &mut JobLog) -> Result<()> {
        let logs = self.docker.logs(
            container,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        pump_output(logs, log).await?;

        let mut wait = std::pin::pin!(self.docker.wait_container(
            container,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        grade_exit(wait.next().await)
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn prepare(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| WorkerError::engine("ping", e))?;
        self.ensure_image(&self.config.builder_image).await?;
        self.ensure_image(&self.config.grader_image).await?;
        Ok(())
    }

    async fn build(&self, src_dir: &Path, out_dir: &Path, log: &mut JobLog) -> Result<PathBuf> {
        let src_host = self.paths.to_host(src_dir)?;
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| WorkerError::environment(format!("failed to create {}", out_dir.display()), e))?;

        info!(image = %self.config.builder_image, "creating builder container");
        let container = self
            .create_and_start("fls-build", builder_config(&self.config, &src_host))
            .await?;

        then_remove(
            self.run_build(&container, out_dir, log),
            self.remove_container(&container),
        )
        .await
    }

    async fn grade(&self, artifact: &Path, log: &mut JobLog) -> Result<()> {
        let dist_dir = artifact.parent().ok_or_else(|| {
            WorkerError::Unexpected(format!("artifact {} has no parent", artifact.display()))
        })?;
        let dist_host = self.paths.to_host(dist_dir)?;
        let name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(ARTIFACT_NAME);

        info!(image = %self.config.grader_image, "starting grader container");
        let container = self
            .create_and_start("fls-grade", grader_config(&self.config, &dist_host, name))
            .await?;

        then_remove(self.run_grade(&container, log), self.remove_container(&container)).await
    }
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn tmpfs_opts(size: &str) -> String {
    format!("size={},mode=755,exec", size)
}

/// Container settings for the long-lived builder.
pub fn builder_config(config: &SandboxConfig, src_host: &Path) -> Config<String> {
    let limits = &config.limits;
    let tmpfs = HashMap::from([
        ("/tmp".to_string(), tmpfs_opts(&limits.tmp_size)),
        ("/dist".to_string(), tmpfs_opts(&limits.dist_size)),
        ("/writable_src".to_string(), tmpfs_opts(&limits.src_size)),
    ]);

    Config {
        image: Some(config.builder_image.clone()),
        entrypoint: Some(vec!["/usr/bin/tini".to_string(), "--".to_string()]),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        env: Some(vec!["DIST=/dist".to_string(), "SRC=/writable_src".to_string()]),
        tty: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:/src:ro", src_host.display())]),
            tmpfs: Some(tmpfs),
            readonly_rootfs: Some(true),
            network_mode: Some("none".to_string()),
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus()),
            pids_limit: Some(limits.pids),
            cap_drop: Some(vec!["ALL".to_string()]),
            // rsync -a copies ownership into /writable_src
            cap_add: Some(vec![
                "CHOWN".to_string(),
                "DAC_OVERRIDE".to_string(),
                "FOWNER".to_string(),
            ]),
            security_opt: Some(vec![NO_NEW_PRIVILEGES.to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container settings for a one-shot grader run against `/dist/<artifact>`.
pub fn grader_config(config: &SandboxConfig, dist_host: &Path, artifact: &str) -> Config<String> {
    let env = config
        .grade_suite
        .as_ref()
        .map(|suite| vec![format!("FLS_SUITE={}", suite)]);

    Config {
        image: Some(config.grader_image.clone()),
        cmd: Some(vec!["/grade.py".to_string(), format!("/dist/{}", artifact)]),
        env,
        tty: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:/dist:rw", dist_host.display())]),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec![NO_NEW_PRIVILEGES.to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn payload(output: &LogOutput) -> &[u8] {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

/// Run `job`, then `remove`, whatever the job's outcome.
async fn then_remove<T>(
    job: impl Future<Output = Result<T>>,
    remove: impl Future<Output = ()>,
) -> Result<T> {
    let result = job.await;
    remove.await;
    result
}

fn build_exit(code: i64) -> Result<()> {
    match code {
        0 => Ok(()),
        code => Err(WorkerError::BuildFailed(code)),
    }
}

fn artifact_exit(code: i64) -> Result<()> {
    match code {
        0 => Ok(()),
        code => Err(WorkerError::ArtifactMissing(code)),
    }
}

/// Map the first item of a grader wait stream to a verdict. The engine
/// reports a non-zero exit as a wait error carrying the code.
fn grade_exit(wait: Option<std::result::Result<ContainerWaitResponse, DockerError>>) -> Result<()> {
    let code = match wait {
        Some(Ok(response)) => response.status_code,
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
        Some(Err(e)) => return Err(WorkerError::engine("wait container", e)),
        None => return Err(WorkerError::Unexpected("grader wait returned nothing".to_string())),
    };
    match code {
        0 => Ok(()),
        code => Err(WorkerError::GradeFailed(code)),
    }
}

fn log_limit_exceeded(log: &JobLog) -> WorkerError {
    WorkerError::LogLimitExceeded { limit: log.limit() }
}

/// Append container output to the job log until the stream ends. Stops
/// reading once the log is truncated so the caller can kill the container.
async fn pump_output<S>(output: S, log: &mut JobLog) -> Result<()>
where
    S: Stream<Item = std::result::Result<LogOutput, DockerError>>,
{
    let mut output = std::pin::pin!(output);
    while let Some(chunk) = output.next().await {
        let chunk = chunk.map_err(|e| WorkerError::engine("stream output", e))?;
        log.append(payload(&chunk)).await?;
        if log.is_truncated() {
            log.flush().await?;
            return Err(log_limit_exceeded(log));
        }
    }
    log.flush().await
}

/// Write stdout to `dest`, sending stderr to the job log. Fails with
/// [`WorkerError::ArtifactTooLarge`] as soon as `limit` would be exceeded;
/// the partial file is removed.
async fn copy_capped<S>(output: S, dest: &Path, limit: u64, log: &mut JobLog) -> Result<u64>
where
    S: Stream<Item = std::result::Result<LogOutput, DockerError>>,
{
    let mut output = std::pin::pin!(output);
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| WorkerError::environment(format!("failed to create {}", dest.display()), e))?;
    let mut total: u64 = 0;

    while let Some(chunk) = output.next().await {
        let chunk = chunk.map_err(|e| WorkerError::engine("stream artifact", e))?;
        match chunk {
            LogOutput::StdOut { message } => {
                total += message.len() as u64;
                if total > limit {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(WorkerError::ArtifactTooLarge { limit });
                }
                file.write_all(&message)
                    .await
                    .map_err(|e| WorkerError::environment("failed to write artifact", e))?;
            }
            other => {
                log.append(payload(&other)).await?;
                if log.is_truncated() {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    log.flush().await?;
                    return Err(log_limit_exceeded(log));
                }
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| WorkerError::environment("failed to write artifact", e))?;
    Ok(total)
}
