use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::BackendType;

#[derive(Parser, Debug)]
#[clap(name = "mountlet")]
#[clap(version, about = "Uniform file and shell operations over sandboxes and storage backends")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "MOUNTLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,

    /// Override the default backend from the configuration
    #[clap(long, global = true, value_enum)]
    pub backend: Option<BackendType>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the immediate children of a directory
    Ls(LsArgs),

    /// Read a window of lines from a file
    Read(ReadArgs),

    /// Create a new file (fails if it exists)
    Write(WriteArgs),

    /// Replace a literal string in a file
    Edit(EditArgs),

    /// Search files for a literal string
    Grep(GrepArgs),

    /// Find files matching a glob pattern
    Glob(GlobArgs),

    /// Execute a shell command in the sandbox
    Exec(ExecArgs),

    /// Copy a host file into the backend
    Upload(UploadArgs),

    /// Copy a file out of the backend onto the host
    Download(DownloadArgs),

    /// Show which sandbox backends are available here
    Backends,

    /// Initialize a new mountlet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// File Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Directory to list
    #[clap(default_value = "/")]
    pub path: String,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    pub path: String,

    /// 0-based line to start at
    #[clap(long, default_value = "0")]
    pub offset: usize,

    /// Maximum number of lines
    #[clap(long, default_value = "500")]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    pub path: String,

    /// File content (read from stdin when omitted)
    pub content: Option<String>,
}

#[derive(Args, Debug)]
pub struct EditArgs {
    pub path: String,

    /// Exact text to replace
    pub old: String,

    /// Replacement text
    pub new: String,

    /// Replace every occurrence instead of requiring exactly one
    #[clap(long)]
    pub replace_all: bool,
}

#[derive(Args, Debug)]
pub struct GrepArgs {
    /// Literal text to search for
    pub pattern: String,

    /// Directory or file to search
    #[clap(default_value = "/")]
    pub path: String,

    /// Only search files whose name matches this glob
    #[clap(long)]
    pub glob: Option<String>,
}

#[derive(Args, Debug)]
pub struct GlobArgs {
    /// Glob pattern, e.g. "**/*.rs"
    pub pattern: String,

    /// Directory the pattern is relative to
    #[clap(default_value = "/")]
    pub path: String,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Command to execute
    pub command: String,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Host file to read
    pub host_path: PathBuf,

    /// Destination path in the backend
    pub path: String,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Path in the backend
    pub path: String,

    /// Host file to write (stdout when omitted)
    pub host_path: Option<PathBuf>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edit() {
        let cli = Cli::try_parse_from([
            "mountlet", "--format", "json", "edit", "/a.txt", "old", "new", "--replace-all",
        ])
        .unwrap();
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
        match cli.command {
            Commands::Edit(args) => {
                assert_eq!(args.path, "/a.txt");
                assert!(args.replace_all);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_defaults_and_backend_override() {
        let cli = Cli::try_parse_from(["mountlet", "-vv", "--backend", "wasmer", "ls"]).unwrap();
        assert_eq!(cli.global_opts.verbose, 2);
        assert_eq!(cli.global_opts.backend, Some(BackendType::Wasmer));
        match cli.command {
            Commands::Ls(args) => assert_eq!(args.path, "/"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_read_window() {
        let cli = Cli::try_parse_from(["mountlet", "read", "/log", "--offset", "98", "--limit", "5"]).unwrap();
        match cli.command {
            Commands::Read(args) => assert_eq!((args.offset, args.limit), (98, 5)),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
