use super::Check;
use crate::config::ExternalCheckConfig;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// An external program invoked once per message.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalTool {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    /// Resolve the configured command. Returns `None`, and logs why, when the
    /// check is switched off or the program cannot be found.
    pub fn from_config(check: &str, config: &ExternalCheckConfig) -> Option<Self> {
        Self::resolve(
            check,
            config.enabled,
            &config.command,
            &config.args,
            config.timeout_seconds,
        )
    }

    pub(crate) fn resolve(
        check: &str,
        enabled: bool,
        command: &str,
        args: &[String],
        timeout_seconds: u64,
    ) -> Option<Self> {
        if !enabled {
            log::info!("{check} check disabled by configuration");
            return None;
        }
        match find_executable(command) {
            Some(program) => {
                log::info!("{check} check enabled using {}", program.display());
                Some(Self::new(
                    program,
                    args.to_vec(),
                    Duration::from_secs(timeout_seconds),
                ))
            }
            None => {
                log::warn!("{command} is not available. {check} checking is disabled.");
                None
            }
        }
    }

    /// Run the tool with `extra_args` appended, optionally feeding `input`
    /// on stdin. The child is killed if it outlives the timeout.
    pub async fn run(&self, extra_args: &[&str], input: Option<&[u8]>) -> Result<ToolOutput, ToolError> {
        let program = self.program.display().to_string();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra_args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdin = child.stdin.take();

        let feed = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                // tools may exit without reading everything
                if let Err(e) = stdin.write_all(input).await {
                    log::debug!("Writing to tool stdin stopped early: {e}");
                }
            }
        };

        let run = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ToolError::Timeout {
                program: program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| ToolError::Wait {
                program: program.clone(),
                source,
            })?;

        log::debug!("{program} closed with return code {:?}", output.status.code());

        Ok(ToolOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Origin signature check: raw message on stdin, exit status zero = valid.
#[derive(Debug, Clone)]
pub struct SignatureCheck {
    tool: Option<ExternalTool>,
}

impl SignatureCheck {
    pub fn from_config(config: &ExternalCheckConfig) -> Self {
        Self {
            tool: ExternalTool::from_config("DKIM", config),
        }
    }

    pub fn with_tool(tool: Option<ExternalTool>) -> Self {
        Self { tool }
    }

    pub async fn verify(&self, raw: &[u8]) -> Check<bool> {
        let Some(tool) = &self.tool else {
            return Check::Disabled;
        };
        match tool.run(&[], Some(raw)).await {
            Ok(output) => Check::Enabled(output.success),
            Err(e) => {
                log::error!("DKIM validation failed: {e}");
                Check::Enabled(false)
            }
        }
    }
}

/// Sender policy check: `(ip, sender, helo)` as arguments, exit status zero
/// = pass.
#[derive(Debug, Clone)]
pub struct PolicyCheck {
    tool: Option<ExternalTool>,
}

impl PolicyCheck {
    pub fn from_config(config: &ExternalCheckConfig) -> Self {
        Self {
            tool: ExternalTool::from_config("SPF", config),
        }
    }

    pub fn with_tool(tool: Option<ExternalTool>) -> Self {
        Self { tool }
    }

    pub async fn verify(&self, ip: IpAddr, sender: &str, helo: &str) -> Check<bool> {
        let Some(tool) = &self.tool else {
            return Check::Disabled;
        };
        let ip = ip.to_string();
        match tool.run(&[ip.as_str(), sender, helo], None).await {
            Ok(output) => Check::Enabled(output.success),
            Err(e) => {
                log::error!("SPF validation failed: {e}");
                Check::Enabled(false)
            }
        }
    }
}

/// Locate `command` either as a path or on `PATH`.
pub fn find_executable(command: &str) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }

    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|full| is_executable(full))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
