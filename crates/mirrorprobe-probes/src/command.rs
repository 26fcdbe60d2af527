//! The package-publish collaborator.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::Command;
use tracing::debug;

use mirrorprobe_core::{BoxFuture, ProbeError};

/// Settings handed to [`PublishCommand::load`] before each publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    /// Registry the package is published to.
    pub registry: String,
    pub loglevel: String,
}

impl PublishConfig {
    pub fn new(registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            loglevel: "silent".to_string(),
        }
    }
}

/// Publishes a package directory. Both steps either succeed or fail with
/// a message; nothing else about them is observed.
pub trait PublishCommand: Send + Sync {
    fn load<'a>(&'a self, config: &'a PublishConfig) -> BoxFuture<'a, Result<(), ProbeError>>;

    fn publish<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, Result<(), ProbeError>>;
}

/// Runs the `npm` executable.
pub struct NpmCli {
    program: PathBuf,
    loaded: Mutex<Option<PublishConfig>>,
}

impl Default for NpmCli {
    fn default() -> Self {
        Self::with_program("npm")
    }
}

impl NpmCli {
    pub fn with_program(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            loaded: Mutex::new(None),
        }
    }

    fn loaded(&self) -> Option<PublishConfig> {
        self.loaded.lock().ok().and_then(|guard| guard.clone())
    }

    async fn run(&self, args: &[String]) -> Result<(), ProbeError> {
        debug!(program = %self.program.display(), ?args, "running publish command");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProbeError::Command(format!("{}: {e}", self.program.display())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(ProbeError::Command(if stderr.is_empty() {
            format!("{} exited with {}", self.program.display(), output.status)
        } else {
            stderr
        }))
    }
}

impl PublishCommand for NpmCli {
    /// Check the executable runs and remember the registry settings.
    fn load<'a>(&'a self, config: &'a PublishConfig) -> BoxFuture<'a, Result<(), ProbeError>> {
        Box::pin(async move {
            self.run(&["--version".to_string()]).await?;
            if let Ok(mut guard) = self.loaded.lock() {
                *guard = Some(config.clone());
            }
            Ok(())
        })
    }

    fn publish<'a>(&'a self, args: &'a [String]) -> BoxFuture<'a, Result<(), ProbeError>> {
        Box::pin(async move {
            let config = self
                .loaded()
                .ok_or_else(|| ProbeError::Command("publish before load".to_string()))?;
            let mut full = vec!["publish".to_string()];
            full.extend(args.iter().cloned());
            full.push(format!("--registry={}", config.registry));
            full.push(format!("--loglevel={}", config.loglevel));
            self.run(&full).await
        })
    }
}
