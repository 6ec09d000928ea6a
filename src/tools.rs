//! External tool discovery
//!
//! The downloader and transcoder are opaque, versioned executables. They are
//! resolved once, before any operation is accepted, in this order:
//!
//! 1. explicit path from [`ToolsConfig`]
//! 2. `<data_root>/bin/<name>` (with `.exe` on Windows)
//! 3. `PATH` lookup via `which`, when `search_path` is enabled
//!
//! Anything else is [`Error::ToolMissing`].

use crate::command::ToolCommand;
use crate::config::{Config, ToolsConfig};
use crate::error::{Error, Result};
use crate::paths::PathResolver;
use crate::process::ProcessRunner;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resolved paths of both external tools
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    /// Media downloader (yt-dlp compatible)
    pub downloader: PathBuf,
    /// Transcoder (ffmpeg compatible)
    pub transcoder: PathBuf,
}

/// First output line of each tool's version query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolVersions {
    /// Downloader version line
    pub downloader: String,
    /// Transcoder version line
    pub transcoder: String,
}

impl Toolchain {
    /// Locate both tools for `config`
    pub fn locate(config: &Config) -> Result<Self> {
        let bin_dir = PathResolver::new(&config.data_root).bin_dir();
        let tools = &config.tools;

        let downloader = locate_tool(
            tools.downloader_path.as_deref(),
            &tools.downloader_name,
            &bin_dir,
            tools,
        )?;
        let transcoder = locate_tool(
            tools.transcoder_path.as_deref(),
            &tools.transcoder_name,
            &bin_dir,
            tools,
        )?;

        info!(?downloader, ?transcoder, "located external tools");
        Ok(Self {
            downloader,
            transcoder,
        })
    }

    /// Run each tool's version query and return its first output line
    pub async fn probe_versions(&self, runner: &ProcessRunner) -> Result<ToolVersions> {
        let downloader = first_line(
            runner,
            &ToolCommand::new(&self.downloader).arg("--version"),
        )
        .await?;
        let transcoder = first_line(
            runner,
            &ToolCommand::new(&self.transcoder)
                .arg("-hide_banner")
                .arg("-version"),
        )
        .await?;

        Ok(ToolVersions {
            downloader,
            transcoder,
        })
    }
}

fn locate_tool(
    explicit: Option<&Path>,
    name: &str,
    bin_dir: &Path,
    tools: &ToolsConfig,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        debug!(?path, "configured tool path does not exist");
        return Err(Error::ToolMissing {
            tool: path.display().to_string(),
        });
    }

    let bundled = bin_dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
    if bundled.is_file() {
        return Ok(bundled);
    }

    if tools.search_path
        && let Ok(found) = which::which(name)
    {
        return Ok(found);
    }

    Err(Error::ToolMissing {
        tool: name.to_string(),
    })
}

async fn first_line(runner: &ProcessRunner, command: &ToolCommand) -> Result<String> {
    let mut first = None;
    runner
        .run(
            command,
            None,
            |_, line| {
                if first.is_none() && !line.trim().is_empty() {
                    first = Some(line.trim().to_string());
                }
            },
            &CancellationToken::new(),
        )
        .await?;

    first.ok_or_else(|| Error::Other(format!("{} printed no version", command.program_name())))
}
