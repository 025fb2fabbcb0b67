//! Command gateway: allowlisted, bounded host command execution
//!
//! Pipeline: validate name → validate arguments → resolve on PATH → spawn → wait (timeout)
//!
//! Commands run from a literal argument vector, never through a shell, in
//! their own process group so a timeout kills everything they started.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CommandError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the arguments of an allowlisted command are checked
#[derive(Debug, Clone, Copy)]
pub enum ArgRule {
    Any,
    /// Every argument must be one of these flags
    Flags(&'static [&'static str]),
    /// `+FORMAT` strings and display flags only
    DateDisplay,
}

#[derive(Debug)]
pub struct AllowedCommand {
    pub name: &'static str,
    pub args: ArgRule,
}

const HOSTNAME_FLAGS: &[&str] = &[
    "-f",
    "--fqdn",
    "--long",
    "-s",
    "--short",
    "-d",
    "--domain",
    "-i",
    "--ip-address",
    "-I",
    "--all-ip-addresses",
    "-A",
    "--all-fqdns",
];

const DATE_FLAGS: &[&str] = &["-u", "--utc", "--universal", "-R", "--rfc-email"];
const DATE_FLAG_PREFIXES: &[&str] = &["-I", "--iso-8601", "--rfc-3339="];

/// Read-only diagnostic commands, sorted by name
const ALLOWLIST: &[AllowedCommand] = &[
    AllowedCommand { name: "date", args: ArgRule::DateDisplay },
    AllowedCommand { name: "df", args: ArgRule::Any },
    AllowedCommand { name: "free", args: ArgRule::Any },
    AllowedCommand { name: "hostname", args: ArgRule::Flags(HOSTNAME_FLAGS) },
    AllowedCommand { name: "id", args: ArgRule::Any },
    AllowedCommand { name: "last", args: ArgRule::Any },
    AllowedCommand { name: "lsblk", args: ArgRule::Any },
    AllowedCommand { name: "lscpu", args: ArgRule::Any },
    AllowedCommand { name: "mount", args: ArgRule::Flags(&["-l"]) },
    AllowedCommand { name: "ps", args: ArgRule::Any },
    AllowedCommand { name: "uname", args: ArgRule::Any },
    AllowedCommand { name: "uptime", args: ArgRule::Any },
    AllowedCommand { name: "w", args: ArgRule::Any },
    AllowedCommand { name: "who", args: ArgRule::Any },
    AllowedCommand { name: "whoami", args: ArgRule::Any },
];

/// A command request: allowlisted name plus literal arguments
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    #[serde(rename = "command")]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Outcome of one finished command
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    #[serde(rename = "command")]
    pub invocation: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct CommandGateway {
    allowlist: &'static [AllowedCommand],
    search_path: Option<OsString>,
}

impl CommandGateway {
    /// Gateway over the fixed allowlist, resolving binaries on the process PATH
    pub fn new() -> Self {
        Self {
            allowlist: ALLOWLIST,
            search_path: std::env::var_os("PATH"),
        }
    }

    #[cfg(test)]
    pub fn with_allowlist(
        allowlist: &'static [AllowedCommand],
        search_path: Option<OsString>,
    ) -> Self {
        Self {
            allowlist,
            search_path,
        }
    }

    /// Allowlisted command names, sorted
    pub fn allowed_commands(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.allowlist.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names
    }

    /// Check the name and arguments without touching the filesystem
    pub fn validate(&self, spec: &CommandSpec) -> Result<&'static AllowedCommand, CommandError> {
        let name = spec.name.trim();
        let allowed = self
            .allowlist
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CommandError::NotAllowed {
                command: name.to_string(),
                allowed: self.allowed_commands(),
            })?;

        for arg in &spec.args {
            if !argument_permitted(allowed.args, arg) {
                return Err(CommandError::ArgumentNotAllowed {
                    command: allowed.name.to_string(),
                    argument: arg.clone(),
                });
            }
        }

        Ok(allowed)
    }

    /// Locate an executable on the search path
    async fn resolve(&self, name: &str) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        for dir in std::env::split_paths(search_path) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let candidate = dir.join(name);
            if is_executable(&candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    /// Run one allowlisted command and capture its output
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let allowed = self.validate(spec)?;
        let program = self
            .resolve(allowed.name)
            .await
            .ok_or_else(|| CommandError::NotFound(allowed.name.to_string()))?;

        let invocation = std::iter::once(allowed.name.to_string())
            .chain(spec.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        info!("Executing: {invocation} (timeout {}s)", timeout.as_secs_f64());

        let mut child = Command::new(&program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: allowed.name.to_string(),
                source,
            })?;

        let pid = child.id();
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));
        let stdout_abort = stdout_task.abort_handle();
        let stderr_abort = stderr_task.abort_handle();

        // Readers are inside the deadline too: a forked grandchild can hold
        // the pipes open after the main process exits.
        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        match finished {
            Ok(Ok((status, stdout, stderr))) => {
                let exit_code = status.code().unwrap_or(-1);
                debug!("{invocation} exited with {exit_code}");
                Ok(CommandResult {
                    invocation,
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            }
            Ok(Err(source)) => {
                stdout_abort.abort();
                stderr_abort.abort();
                Err(CommandError::Spawn {
                    command: allowed.name.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!("{invocation} timed out after {:?}, killing process group", timeout);
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                stdout_abort.abort();
                stderr_abort.abort();
                Err(CommandError::TimedOut {
                    command: allowed.name.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Default for CommandGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn argument_permitted(rule: ArgRule, arg: &str) -> bool {
    match rule {
        ArgRule::Any => true,
        ArgRule::Flags(flags) => flags.contains(&arg),
        ArgRule::DateDisplay => {
            arg.starts_with('+')
                || DATE_FLAGS.contains(&arg)
                || DATE_FLAG_PREFIXES.iter().any(|p| arg.starts_with(p))
        }
    }
}

async fn is_executable(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!("Failed to read command output: {e}");
        }
    }
    buf
}

fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("killpg({pid}) failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    const TEST_ALLOWLIST: &[AllowedCommand] = &[
        AllowedCommand { name: "echo", args: ArgRule::Any },
        AllowedCommand { name: "ls", args: ArgRule::Any },
        AllowedCommand { name: "sleep", args: ArgRule::Any },
    ];

    fn spec(name: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_allowlist_is_sorted_and_read_only() {
        let gateway = CommandGateway::new();
        let names = gateway.allowed_commands();
        assert_eq!(names.len(), 15);
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        for forbidden in ["rm", "sh", "bash", "kill", "reboot", "shutdown", "chmod"] {
            assert!(!names.contains(&forbidden), "{forbidden} must not be allowlisted");
        }
    }

    #[tokio::test]
    async fn test_rejects_unlisted_command_in_any_case() {
        let gateway = CommandGateway::new();
        for name in ["rm", "RM", " Rm ", "/bin/rm", "ps;rm", "PS"] {
            let err = gateway
                .execute(&spec(name, &["-rf", "/"]), DEFAULT_TIMEOUT)
                .await
                .unwrap_err();
            match err {
                CommandError::NotAllowed { allowed, .. } => assert!(allowed.contains(&"ps")),
                other => panic!("expected NotAllowed for {name:?}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_name_checked_before_path_resolution() {
        // No search path at all: an unlisted name must still be NotAllowed, not NotFound
        let gateway = CommandGateway::with_allowlist(ALLOWLIST, None);
        let err = gateway.execute(&spec("rm", &[]), DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CommandError::NotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_allowlisted_binary_absent_is_not_found() {
        let empty = TempDir::new().unwrap();
        let gateway =
            CommandGateway::with_allowlist(ALLOWLIST, Some(empty.path().as_os_str().to_owned()));
        let err = gateway.execute(&spec("ps", &[]), DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CommandError::NotFound(ref name) if name == "ps"));
    }

    #[tokio::test]
    async fn test_resolve_skips_non_executables() {
        let bin = TempDir::new().unwrap();
        let plain = bin.path().join("uname");
        std::fs::write(&plain, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();

        let gateway =
            CommandGateway::with_allowlist(ALLOWLIST, Some(bin.path().as_os_str().to_owned()));
        assert_eq!(gateway.resolve("uname").await, None);

        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(gateway.resolve("uname").await, Some(plain));
    }

    #[test]
    fn test_argument_rules() {
        let gateway = CommandGateway::new();
        assert!(gateway.validate(&spec("hostname", &["-f"])).is_ok());
        assert!(gateway.validate(&spec("hostname", &["evil-name"])).is_err());
        assert!(gateway.validate(&spec("hostname", &["-F", "/tmp/name"])).is_err());
        assert!(gateway.validate(&spec("date", &["+%s"])).is_ok());
        assert!(gateway.validate(&spec("date", &["-u", "-Iseconds"])).is_ok());
        assert!(gateway.validate(&spec("date", &["-s", "2020-01-01"])).is_err());
        assert!(gateway.validate(&spec("date", &["010100002020"])).is_err());
        assert!(gateway.validate(&spec("mount", &[])).is_ok());
        assert!(gateway.validate(&spec("mount", &["-l"])).is_ok());
        assert!(gateway.validate(&spec("mount", &["/dev/sda1", "/mnt"])).is_err());
        assert!(gateway.validate(&spec("ps", &["aux"])).is_ok());

        let err = gateway.validate(&spec("hostname", &["pwned"])).unwrap_err();
        assert!(matches!(
            err,
            CommandError::ArgumentNotAllowed { ref argument, .. } if argument == "pwned"
        ));
    }

    #[tokio::test]
    async fn test_execute_uname() {
        let gateway = CommandGateway::new();
        let result = gateway
            .execute(&spec("uname", &["-s"]), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.invocation, "uname -s");
        assert!(!result.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let gateway = CommandGateway::with_allowlist(TEST_ALLOWLIST, std::env::var_os("PATH"));
        let result = gateway
            .execute(&spec("echo", &["$(whoami)", ";", "rm", "*"]), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "$(whoami) ; rm *\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_verbatim() {
        let gateway = CommandGateway::with_allowlist(TEST_ALLOWLIST, std::env::var_os("PATH"));
        let result = gateway
            .execute(&spec("ls", &["/nonexistent/ninode/path"]), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_ne!(result.exit_code, 0);
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let gateway = CommandGateway::with_allowlist(TEST_ALLOWLIST, std::env::var_os("PATH"));
        let start = Instant::now();
        let err = gateway
            .execute(&spec("sleep", &["10"]), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
