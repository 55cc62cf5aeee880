//! Sidecar process construction and supervision helpers.
//!
//! The host the bridge talks to is normally a child process (the sidecar).
//! [`SidecarCommand`] decides how to launch it: on unix it runs through the
//! user's login shell so that rc files set up `PATH`, SSH agents and the like,
//! exactly as a terminal would. The sidecar's stderr is forwarded line by line
//! to `tracing` under the `sidecar` target.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::info;

use crate::config::SidecarConfig;

/// Username the local server expects in Basic auth.
pub const SERVER_USERNAME: &str = "opencode";

/// How the sidecar process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl SidecarExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Launch description for the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    login_shell: Option<String>,
}

impl SidecarCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            login_shell: None,
        }
    }

    /// Build the command described by `[sidecar]`, with the environment the
    /// desktop server expects.
    pub fn from_config(config: &SidecarConfig, state_dir: &str, password: &str) -> Self {
        let mut cmd = Self::new(config.program.clone(), config.args.clone())
            .env("OPENCODE_CLIENT", "desktop")
            .env("OPENCODE_SERVER_USERNAME", SERVER_USERNAME)
            .env("OPENCODE_SERVER_PASSWORD", password)
            .env("XDG_STATE_HOME", state_dir);
        if config.use_login_shell && cfg!(unix) {
            cmd = cmd.through_login_shell(user_shell());
        }
        cmd
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run the program as `<shell> -il -c "<program> <args>"`.
    #[must_use]
    pub fn through_login_shell(mut self, shell: String) -> Self {
        self.login_shell = Some(shell);
        self
    }

    /// The `-c` script passed to the login shell, if one is used.
    pub fn shell_script(&self) -> Option<String> {
        let shell = self.login_shell.as_deref()?;
        let args: Vec<String> = self.args.iter().map(|a| shell_escape(a)).collect();
        // nushell needs `^` to run an external command from a string path
        let program = if shell.ends_with("/nu") {
            format!("^\"{}\"", self.program)
        } else {
            format!("\"{}\"", self.program)
        };
        if args.is_empty() {
            Some(program)
        } else {
            Some(format!("{program} {}", args.join(" ")))
        }
    }

    /// A tokio command with all three stdio streams piped.
    pub fn build(&self) -> Command {
        let mut cmd = match (&self.login_shell, self.shell_script()) {
            (Some(shell), Some(script)) => {
                let mut c = Command::new(shell);
                c.args(["-il", "-c", &script]);
                c
            }
            _ => {
                let mut c = Command::new(&self.program);
                c.args(&self.args);
                c
            }
        };
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// The user's shell from `$SHELL`, falling back to `/bin/sh`.
pub fn user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Quote `input` for a POSIX shell.
///
/// - `""` → `''`
/// - `it's` → `'it'"'"'s'`
pub fn shell_escape(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    let mut escaped = String::with_capacity(input.len() + 2);
    escaped.push('\'');
    escaped.push_str(&input.replace('\'', "'\"'\"'"));
    escaped.push('\'');
    escaped
}

/// Forward each stderr line of the sidecar to `tracing`.
pub fn forward_stderr(stderr: ChildStderr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "sidecar", "{line}");
        }
    })
}
