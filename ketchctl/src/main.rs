use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

const CONFIG_DIR_MODE: u32 = 0o700;
const CONFIG_FILE_MODE: u32 = 0o600;

#[derive(Parser)]
#[command(name = "ketchctl")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Persists the management API's address for subsequent commands.
    Login {
        #[arg(long)]
        api_server: String,
        #[arg(long, default_value_t = 7460)]
        api_port: u16,
    },
    /// GET /api/v1/<resource>, rendered as YAML.
    Get { resource: String },
    /// POST /api/v1/<resource> from a YAML document, rendered as YAML.
    Create {
        resource: String,
        #[arg(short = 'f', long = "file")]
        file: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Config {
    api_server: String,
    api_port: u16,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Login { api_server, api_port } => match login(api_server, api_port) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
        Command::Get { resource } => match get(&resource) {
            Ok(yaml) => {
                print!("{yaml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
        Command::Create { resource, file } => match create(&resource, &file) {
            Ok((yaml, has_errors)) => {
                print!("{yaml}");
                if has_errors {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    PathBuf::from(home).join(".ketchctl.d")
}

fn login(api_server: String, api_port: u16) -> Result<(), String> {
    let dir = config_dir();
    create_dir_mode_0700(&dir).map_err(|e| format!("failed to create {}: {e}", dir.display()))?;

    let path = dir.join("config");
    let yaml = serde_yaml::to_string(&Config { api_server, api_port }).map_err(|e| e.to_string())?;
    write_file_mode_0600(&path, &yaml).map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn create_dir_mode_0700(dir: &Path) -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(CONFIG_DIR_MODE).create(dir)
}

#[cfg(not(unix))]
fn create_dir_mode_0700(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_file_mode_0600(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(CONFIG_FILE_MODE))
}

#[cfg(not(unix))]
fn write_file_mode_0600(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)
}

fn load_config() -> Result<Config, String> {
    let path = config_dir().join("config");
    let contents = fs::read_to_string(&path).map_err(|e| format!("failed to read {}: run `ketchctl login` first ({e})", path.display()))?;
    serde_yaml::from_str(&contents).map_err(|e| format!("invalid config at {}: {e}", path.display()))
}

fn get(resource: &str) -> Result<String, String> {
    let config = load_config()?;
    let url = format!("http://{}:{}/api/v1/{resource}", config.api_server, config.api_port);
    let body = request_json(ureq::get(&url).call())?;
    serde_yaml::to_string(&body).map_err(|e| e.to_string())
}

fn create(resource: &str, file: &str) -> Result<(String, bool), String> {
    let config = load_config()?;
    let raw = if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).map_err(|e| e.to_string())?;
        buf
    } else {
        fs::read_to_string(file).map_err(|e| format!("failed to read {file}: {e}"))?
    };
    let attributes: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| format!("invalid YAML in {file}: {e}"))?;
    let envelope = serde_json::json!({ "data": [{ "type": resource, "attributes": attributes }] });

    let url = format!("http://{}:{}/api/v1/{resource}", config.api_server, config.api_port);
    let body = request_json(ureq::post(&url).send_json(envelope))?;

    let has_errors = body.get("errors").and_then(|e| e.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
    let yaml = serde_yaml::to_string(&body).map_err(|e| e.to_string())?;
    Ok((yaml, has_errors))
}

fn request_json(result: Result<ureq::Response, ureq::Error>) -> Result<serde_json::Value, String> {
    match result {
        Ok(response) => response.into_json().map_err(|e| format!("invalid JSON response: {e}")),
        Err(ureq::Error::Status(_, response)) => response.into_json().map_err(|e| format!("invalid JSON error response: {e}")),
        Err(e) => Err(format!("request failed: {e}")),
    }
}
