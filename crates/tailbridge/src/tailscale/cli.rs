//! `MeshControl` backed by the external `tailscale` binary. Every call is a
//! short-lived child process talking to the local daemon socket; stdout is
//! JSON for status reads and human text otherwise.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::debug;

use crate::service::DesiredService;
use crate::tailscale::status::{FunnelStatus, ServeStatus};
use crate::tailscale::{MeshControl, MeshError};
use crate::telemetry;

const PREVIEW_CHARS: usize = 120;

pub struct CliMesh {
    binary: String,
    socket: String,
    timeout: Duration,
}

impl CliMesh {
    pub fn new(binary: impl Into<String>, socket: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            socket: socket.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, MeshError> {
        let command = display_command(&self.binary, args);
        let subcommand = args.first().map(String::as_str).unwrap_or("unknown");
        debug!(command = %command, "running mesh cli");

        let mut child = Command::new(&self.binary);
        child
            .arg("--socket")
            .arg(&self.socket)
            .args(args)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, child.output()).await {
            Ok(spawned) => spawned.map_err(|source| {
                telemetry::record_cli_call(subcommand, "launch_error");
                MeshError::Launch {
                    command: command.clone(),
                    source,
                }
            })?,
            Err(_) => {
                telemetry::record_cli_call(subcommand, "timeout");
                return Err(MeshError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            telemetry::record_cli_call(subcommand, "ok");
            return Ok(stdout);
        }

        telemetry::record_cli_call(subcommand, "error");
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(command, &stdout, &stderr))
    }
}

#[async_trait]
impl MeshControl for CliMesh {
    async fn serve_status(&self) -> Result<ServeStatus, MeshError> {
        let args = string_args(&["serve", "status", "--json"]);
        match self.run(&args).await {
            Ok(raw) => decode_status("serve status", &raw),
            Err(MeshError::NotFound { .. }) => Ok(ServeStatus::default()),
            Err(err) => Err(err),
        }
    }

    async fn funnel_status(&self) -> Result<FunnelStatus, MeshError> {
        let args = string_args(&["funnel", "status", "--json"]);
        match self.run(&args).await {
            Ok(raw) => decode_status("funnel status", &raw),
            Err(MeshError::NotFound { .. }) => Ok(FunnelStatus::default()),
            Err(err) => Err(err),
        }
    }

    async fn apply_service(&self, service: &DesiredService) -> Result<(), MeshError> {
        let qualified = service.qualified_name();
        let args = vec![
            "serve".to_string(),
            format!("--service={qualified}"),
            format!(
                "--{}={}",
                service.service_protocol.as_str(),
                service.service_port
            ),
            service.destination(),
        ];
        self.run(&args).await?;

        if let Some(funnel) = &service.funnel {
            let destination = service
                .funnel_destination()
                .unwrap_or_else(|| service.destination());
            let args = vec![
                "funnel".to_string(),
                format!("--service={qualified}"),
                format!("--{}={}", funnel.protocol.as_str(), funnel.public_port),
                destination,
            ];
            self.run(&args).await?;
        }

        Ok(())
    }

    async fn delete_service(&self, qualified_name: &str) -> Result<(), MeshError> {
        let args = vec![
            "serve".to_string(),
            format!("--service={qualified_name}"),
            "off".to_string(),
        ];
        match self.run(&args).await {
            Ok(_) => Ok(()),
            Err(MeshError::NotFound { .. }) => {
                debug!(service = qualified_name, "service already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn display_command(binary: &str, args: &[String]) -> String {
    let mut command = binary.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

/// Maps a failed invocation onto the error taxonomy by matching known CLI
/// phrasings, preferring stderr over stdout for the detail.
fn classify_failure(command: String, stdout: &str, stderr: &str) -> MeshError {
    const NOT_FOUND: &[&str] = &[
        "not found",
        "does not exist",
        "no services",
        "nothing to show",
        "no funnel",
    ];
    const CONFLICT: &[&str] = &["already serving", "want to serve"];
    const UNTAGGED: &[&str] = &["must be tagged nodes"];

    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    }
    .to_string();
    let haystack = detail.to_lowercase();

    if NOT_FOUND.iter().any(|pattern| haystack.contains(pattern)) {
        MeshError::NotFound { detail }
    } else if CONFLICT.iter().any(|pattern| haystack.contains(pattern)) {
        MeshError::ConfigConflict { detail }
    } else if UNTAGGED.iter().any(|pattern| haystack.contains(pattern)) {
        MeshError::UntaggedNode { detail }
    } else {
        MeshError::CommandFailed { command, detail }
    }
}

/// The CLI prints human-readable warnings ahead of the JSON document on the
/// same stream. Decoding starts at the first opening brace; empty output is
/// an empty config.
fn strip_warnings(raw: &str) -> &str {
    match raw.find('{') {
        Some(start) => &raw[start..],
        None => raw,
    }
}

fn decode_status<T>(command: &str, raw: &str) -> Result<T, MeshError>
where
    T: DeserializeOwned + Default,
{
    let stripped = strip_warnings(raw).trim();
    if stripped.is_empty() {
        return Ok(T::default());
    }
    if !stripped.starts_with('{') {
        return Err(MeshError::InvalidJson {
            command: command.to_string(),
            preview: preview(raw),
        });
    }
    serde_json::from_str(stripped).map_err(|source| MeshError::Decode {
        command: command.to_string(),
        source,
    })
}

fn preview(raw: &str) -> String {
    let flat = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(PREVIEW_CHARS).collect()
}
