use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "kodetron-runner", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compile and run a single source file
    Run {
        /// Source file to compile
        source: PathBuf,

        /// File fed to the program's standard input
        #[arg(long = "input", short = 'i')]
        input: Option<PathBuf>,
    },
    /// Serve the run endpoint over HTTP
    Serve {
        #[arg(long = "bind")]
        bind_address: Option<String>,

        #[arg(long = "port")]
        bind_port: Option<u16>,
    },
}

impl CliArgs {
    /// Load the configuration from the specified file, the user config file,
    /// or fall back to defaults
    pub fn to_config(&self) -> anyhow::Result<Config> {
        match &self.config_path {
            Some(path) => Config::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    log::info!("Using configuration at {}", path.display());
                    Config::from_file(&path)
                }
                _ => Ok(Config::default()),
            },
        }
    }
}

/// `<config_dir>/config.json` for the current user, if a home directory exists
pub fn default_config_path() -> Option<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "kodetron")?;
    Some(proj_dirs.config_dir().join("config.json"))
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub trigger_policy: TriggerPolicy,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Compiler executable, resolved through `PATH`
    pub compiler: String,
    /// Extra arguments placed after `<source> -o <artifact>`
    pub compiler_flags: Vec<String>,
    pub source_name: String,
    pub compile_timeout: MilliSecond,
    pub run_timeout: MilliSecond,
    /// Cap on captured program output and compiler diagnostics
    pub output_limit: ByteSize,
    pub compile_failure: CompileFailurePolicy,
    /// Parent directory of per-run workspaces, the OS temp dir if unset
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compiler: "g++".to_string(),
            compiler_flags: Vec::new(),
            source_name: "main.cpp".to_string(),
            compile_timeout: MilliSecond(4000),
            run_timeout: MilliSecond(5000),
            output_limit: ByteSize(1 << 20),
            compile_failure: CompileFailurePolicy::default(),
            scratch_dir: None,
        }
    }
}

impl SandboxConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// What makes a finished compiler process count as a failed compilation
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompileFailurePolicy {
    /// Non-zero exit status; warnings on stderr do not block the run
    #[default]
    ExitStatus,
    /// Any output on stderr, even with a zero exit status
    Stderr,
    /// Either of the above
    Either,
}

/// How a Run trigger is handled while another run is still in flight
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    #[default]
    Reject,
    Queue,
}
