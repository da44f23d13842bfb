//! Launching real editor instances

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::OwnedMutexGuard;
use tokio::time::sleep;

use super::profile::{prepare_profile, ProfileLocks};
use super::{EnvironmentHandle, IsolationMode, ProvisionError, ProvisionRequest, Provisioner};
use crate::common::config::{Channels, Config, ProvisionConfig};
use crate::scenario::Channel;

/// Process, profile directory and profile lock that live as long as the handle
pub(super) struct EditorResources {
    child: Child,
    /// Fresh or sandboxed profile directory, deleted when dropped
    _temp: Option<TempDir>,
    /// Held while a reused profile is in use
    _profile_lock: Option<OwnedMutexGuard<()>>,
}

/// Provisions editor instances from installed channel executables
pub struct EditorProvisioner {
    channels: Channels,
    settings: ProvisionConfig,
    profiles_root: PathBuf,
    reused: ProfileLocks,
}

impl EditorProvisioner {
    pub fn new(config: &Config) -> Self {
        Self {
            channels: config.channels.clone(),
            settings: config.provision.clone(),
            profiles_root: config.profiles_dir(),
            reused: ProfileLocks::default(),
        }
    }

    /// Executable and extra args for a channel, never substituting another
    /// channel
    fn resolve_executable(&self, channel: Channel) -> Result<(PathBuf, Vec<String>), ProvisionError> {
        if let Some(configured) = self.channels.get(channel) {
            if configured.executable.exists() {
                return Ok((configured.executable.clone(), configured.args.clone()));
            }
            return Err(ProvisionError::ChannelUnavailable {
                channel: channel.to_string(),
                searched: configured.executable.display().to_string(),
            });
        }

        which::which(channel.executable_name())
            .map(|path| (path, Vec::new()))
            .map_err(|_| ProvisionError::ChannelUnavailable {
                channel: channel.to_string(),
                searched: channel.executable_name().to_string(),
            })
    }

    async fn launch(
        &self,
        request: &ProvisionRequest,
    ) -> Result<EnvironmentHandle, ProvisionError> {
        let channel = request.version.channel;
        let (executable, extra_args) = self.resolve_executable(channel)?;

        let version = match probe_version(&executable).await {
            Ok(version) => Some(version),
            Err(e) if request.version.requirement.is_some() => return Err(e),
            Err(e) => {
                tracing::warn!(%channel, "{}", e);
                None
            }
        };
        if let (Some(required), Some(found)) = (&request.version.requirement, &version) {
            if !request.version.accepts(&release_of(found)) {
                return Err(ProvisionError::VersionMismatch {
                    channel: channel.to_string(),
                    found: found.to_string(),
                    required: required.to_string(),
                });
            }
        }

        if let Some(workspace) = &request.workspace {
            if !workspace.exists() {
                return Err(ProvisionError::WorkspaceMissing(
                    workspace.display().to_string(),
                ));
            }
        }

        let profile_name = request
            .profile
            .clone()
            .unwrap_or_else(|| self.settings.default_profile.clone());
        let profile_lock = match request.isolation {
            IsolationMode::Reuse => {
                tracing::debug!(profile = %profile_name, "Waiting for reused profile");
                Some(self.reused.hold(&profile_name).await)
            }
            IsolationMode::SandboxReset | IsolationMode::FreshProfile => None,
        };
        let profile = prepare_profile(request.isolation, &self.profiles_root, &profile_name)
            .map_err(|e| ProvisionError::Profile {
                profile: profile_name.clone(),
                error: e.to_string(),
            })?;

        let port = find_free_port().map_err(|e| ProvisionError::Launch {
            executable: executable.display().to_string(),
            error: format!("no free debugging port: {}", e),
        })?;

        let mut cmd = Command::new(&executable);
        cmd.arg(format!("--user-data-dir={}", profile.user_data_dir.display()))
            .arg(format!("--extensions-dir={}", profile.extensions_dir.display()))
            .arg(format!("--remote-debugging-port={}", port))
            .args([
                "--new-window",
                "--wait",
                "--disable-telemetry",
                "--disable-workspace-trust",
                "--skip-welcome",
                "--skip-release-notes",
                "--disable-updates",
            ]);
        if request.isolation == IsolationMode::FreshProfile {
            cmd.arg("--disable-extensions");
        }
        cmd.args(&extra_args);
        if let Some(workspace) = &request.workspace {
            cmd.arg(workspace);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(%channel, port, profile = %profile.name, "Launching editor");
        let child = cmd.spawn().map_err(|e| ProvisionError::Launch {
            executable: executable.display().to_string(),
            error: e.to_string(),
        })?;

        let logs_dir = profile.user_data_dir.join("logs");
        let mut handle = EnvironmentHandle {
            id: format!("env-{}", uuid::Uuid::new_v4().simple()),
            channel,
            version,
            isolation: request.isolation,
            profile: profile.name,
            profile_dir: profile.user_data_dir,
            logs_dir,
            workspace: request.workspace.clone(),
            debug_port: Some(port),
            resources: Some(EditorResources {
                child,
                _temp: profile.temp,
                _profile_lock: profile_lock,
            }),
        };

        if let Err(e) = self.wait_until_responsive(&mut handle, port).await {
            self.release(handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Poll the debugging endpoint until the editor answers
    async fn wait_until_responsive(
        &self,
        handle: &mut EnvironmentHandle,
        port: u16,
    ) -> Result<(), ProvisionError> {
        let url = format!("http://127.0.0.1:{}/json/version", port);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| ProvisionError::Launch {
                executable: handle.channel.executable_name().to_string(),
                error: e.to_string(),
            })?;
        let budget = Duration::from_secs(self.settings.startup_timeout_secs);
        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < budget {
            attempts += 1;
            if let Some(resources) = handle.resources.as_mut() {
                if let Ok(Some(status)) = resources.child.try_wait() {
                    return Err(ProvisionError::Launch {
                        executable: handle.channel.executable_name().to_string(),
                        error: format!("editor exited during startup ({})", status),
                    });
                }
            }

            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(attempts, "Editor is responsive");
                    return Ok(());
                }
                Ok(resp) => tracing::debug!("Debug endpoint returned {}", resp.status()),
                Err(e) if !e.is_connect() => tracing::debug!("Debug endpoint error: {}", e),
                Err(_) => {}
            }
            sleep(Duration::from_millis(200)).await;
        }

        Err(ProvisionError::StartupTimeout {
            channel: handle.channel.to_string(),
            secs: self.settings.startup_timeout_secs,
        })
    }
}

#[async_trait]
impl Provisioner for EditorProvisioner {
    #[tracing::instrument(skip_all, fields(version = %request.version, isolation = request.isolation.as_str()))]
    async fn acquire(&self, request: &ProvisionRequest) -> Result<EnvironmentHandle, ProvisionError> {
        self.launch(request).await
    }

    #[tracing::instrument(skip_all, fields(env = %handle.id))]
    async fn release(&self, mut handle: EnvironmentHandle) {
        let Some(mut resources) = handle.resources.take() else {
            return;
        };
        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);
        terminate(&mut resources.child, grace).await;
        tracing::debug!("Environment released");
        // Dropping the resources removes the profile sandbox and frees the lock
    }
}

/// SIGTERM the editor's process group, then kill after the grace period
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Negative pid targets the whole group the editor leads
        let result = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if result == 0 {
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "Editor ignored SIGTERM, killing");
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
}

/// Ask the executable for its version (`code --version` prints it first)
async fn probe_version(executable: &Path) -> Result<semver::Version, ProvisionError> {
    let probe_error = |error: String| ProvisionError::VersionProbe {
        executable: executable.display().to_string(),
        error,
    };

    let output = tokio::time::timeout(
        Duration::from_secs(30),
        Command::new(executable)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| probe_error("timed out".to_string()))?
    .map_err(|e| probe_error(e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version_output(&stdout).ok_or_else(|| {
        probe_error(format!(
            "unexpected output '{}'",
            stdout.lines().next().unwrap_or("").trim()
        ))
    })
}

fn parse_version_output(output: &str) -> Option<semver::Version> {
    let first = output.lines().next()?.trim();
    semver::Version::parse(first).ok()
}

/// Insiders builds report `1.96.0-insider`; requirements match the release
fn release_of(version: &semver::Version) -> semver::Version {
    semver::Version::new(version.major, version.minor, version.patch)
}

fn find_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
