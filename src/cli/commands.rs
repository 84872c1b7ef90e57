use std::io::{Read, Write};

use tracing::info;

use crate::backend::composite::CompositeBackend;
use crate::backend::protocol::{Backend, FileTransfer, SandboxBackend};
use crate::backend::types::{ExecuteResponse, FileInfo, GrepMatch};
use crate::cli::args::{
    Commands, ConfigAction, ConfigArgs, DownloadArgs, EditArgs, ExecArgs, GlobArgs, GrepArgs,
    InitArgs, LsArgs, OutputFormat, ReadArgs, UploadArgs, WriteArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::MountletConfig;
use crate::error::{MountletError, Result};
use crate::sandbox::factory::available_backends;

/// Exit status used when a command did not finish (timeout or kill).
const UNFINISHED_EXIT_CODE: i32 = 124;

/// Run one backend command and return the process exit code.
///
/// Operations that report failure in-band (write, edit, grep, transfers) are
/// printed and turned into exit code 1; only infrastructure failures are
/// returned as errors.
pub async fn dispatch(command: Commands, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    match command {
        Commands::Ls(args) => ls(args, backend, format).await,
        Commands::Read(args) => read(args, backend).await,
        Commands::Write(args) => write(args, backend, format).await,
        Commands::Edit(args) => edit(args, backend, format).await,
        Commands::Grep(args) => grep(args, backend, format).await,
        Commands::Glob(args) => glob(args, backend, format).await,
        Commands::Exec(args) => exec(args, backend, format).await,
        Commands::Upload(args) => upload(args, backend, format).await,
        Commands::Download(args) => download(args, backend).await,
        Commands::Backends | Commands::Init(_) | Commands::Config(_) => Err(MountletError::Config(
            "command does not operate on a backend".to_string(),
        )),
    }
}

// ============================================================================
// File Commands
// ============================================================================

async fn ls(args: LsArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    let entries = backend.ls_info(&args.path).await;
    print_entries(&entries, format)?;
    Ok(0)
}

async fn read(args: ReadArgs, backend: &CompositeBackend) -> Result<i32> {
    let content = backend.read(&args.path, args.offset, args.limit).await;
    println!("{}", content);
    // failures come back as text; content lines are always numbered
    Ok(if content.starts_with("Error") { 1 } else { 0 })
}

async fn write(args: WriteArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    let content = match args.content {
        Some(content) => content,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    info!(path = %args.path, bytes = content.len(), "Writing file");

    let result = backend.write(&args.path, &content).await;
    match format {
        OutputFormat::Text => match &result.error {
            None => println!("Wrote {}", result.path),
            Some(error) => eprintln!("{}", error),
        },
        OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
    }
    Ok(if result.is_ok() { 0 } else { 1 })
}

async fn edit(args: EditArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    let result = backend
        .edit(&args.path, &args.old, &args.new, args.replace_all)
        .await;
    match format {
        OutputFormat::Text => match &result.error {
            None => println!(
                "Replaced {} occurrence(s) in {}",
                result.occurrences.unwrap_or(0),
                result.path
            ),
            Some(error) => eprintln!("{}", error),
        },
        OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
    }
    Ok(if result.is_ok() { 0 } else { 1 })
}

async fn grep(args: GrepArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    match backend.grep_raw(&args.pattern, &args.path, args.glob.as_deref()).await {
        Ok(matches) => {
            match format {
                OutputFormat::Text => {
                    for m in &matches {
                        println!("{}", format_match(m));
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&matches)?),
            }
            Ok(0)
        }
        Err(message) => {
            match format {
                OutputFormat::Text => eprintln!("{}", message),
                OutputFormat::Json => println!("{}", serde_json::json!({ "error": message })),
            }
            Ok(1)
        }
    }
}

async fn glob(args: GlobArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    let entries = backend.glob_info(&args.pattern, &args.path).await;
    print_entries(&entries, format)?;
    Ok(0)
}

// ============================================================================
// Sandbox Commands
// ============================================================================

async fn exec(args: ExecArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    info!(command = %args.command, "Executing command");
    let response = backend.execute(&args.command).await?;
    output_execute_response(&response, format);
    Ok(response.exit_code.unwrap_or(UNFINISHED_EXIT_CODE))
}

async fn upload(args: UploadArgs, backend: &CompositeBackend, format: OutputFormat) -> Result<i32> {
    let content = tokio::fs::read(&args.host_path).await?;
    let mut responses = backend.upload_files(&[(args.path, content)]).await?;
    let response = responses
        .pop()
        .ok_or_else(|| MountletError::SandboxExecution("upload returned no response".to_string()))?;

    match format {
        OutputFormat::Text => match response.error {
            None => println!("Uploaded {} -> {}", args.host_path.display(), response.path),
            Some(error) => eprintln!("{}: {}", response.path, error),
        },
        OutputFormat::Json => println!("{}", serde_json::to_string(&response)?),
    }
    Ok(if response.error.is_none() { 0 } else { 1 })
}

async fn download(args: DownloadArgs, backend: &CompositeBackend) -> Result<i32> {
    let mut responses = backend.download_files(&[args.path]).await?;
    let response = responses
        .pop()
        .ok_or_else(|| MountletError::SandboxExecution("download returned no response".to_string()))?;

    match (response.content, response.error) {
        (Some(content), None) => {
            match &args.host_path {
                Some(host_path) => {
                    tokio::fs::write(host_path, &content).await?;
                    println!("Downloaded {} -> {}", response.path, host_path.display());
                }
                None => std::io::stdout().write_all(&content)?,
            }
            Ok(0)
        }
        (_, error) => {
            let error = error.map(|e| e.to_string()).unwrap_or_else(|| "no content".to_string());
            eprintln!("{}: {}", response.path, error);
            Ok(1)
        }
    }
}

/// Show which backends can be used on this machine
pub fn backends(format: OutputFormat) -> Result<()> {
    let backends = available_backends();
    match format {
        OutputFormat::Text => {
            println!("{:<12} {:<10} DESCRIPTION", "BACKEND", "STATUS");
            println!("{}", "-".repeat(70));
            for backend in backends {
                let status = if backend.available { "ready" } else { "missing" };
                let reason = backend
                    .unavailable_reason
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default();
                println!("{:<12} {:<10} {}{}", backend.name, status, backend.description, reason);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&backends)?),
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    // Create parent directories if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write default configuration
    let default_config = MountletConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).map_err(|e| MountletError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # List the sandbox working directory");
    println!("  mountlet ls /");
    println!();
    println!("  # Run a command in the sandbox");
    println!("  mountlet exec \"ls -la\"");
    println!();
    println!("  # Route a prefix to durable storage (add to the config file)");
    println!("  [[routes]]");
    println!("  prefix = \"/memories/\"");
    println!("  kind = \"store\"");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: MountletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| MountletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn print_entries(entries: &[FileInfo], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for entry in entries {
                println!("{}", format_entry(entry));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
    }
    Ok(())
}

fn format_entry(entry: &FileInfo) -> String {
    if entry.is_dir {
        entry.path.clone()
    } else {
        format!("{:<48} {:>10}", entry.path, entry.size.unwrap_or(0))
    }
}

fn format_match(m: &GrepMatch) -> String {
    format!("{}:{}:{}", m.path, m.line, m.text)
}

fn output_execute_response(response: &ExecuteResponse, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            print!("{}", response.output);
            if response.truncated {
                eprintln!("[output truncated]");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "output": response.output,
                    "exit_code": response.exit_code,
                    "truncated": response.truncated,
                })
            );
        }
    }
}
