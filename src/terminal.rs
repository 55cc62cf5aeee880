//! Terminal front end for the prompt relay.
//!
//! [`TerminalView`] prints prompts to a writer (stderr in the binary) and
//! turns terminal echo off while a masked prompt is open. [`spawn_input`]
//! feeds lines from a reader (stdin) into the relay; end of input cancels
//! whatever is open.

use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::prompt::{ActivePrompt, PromptKind, PromptView, RelayHandle};

/// Prompt view writing to a terminal.
pub struct TerminalView<W> {
    out: W,
    mask_input: bool,
    echo: Option<echo::Suppressed>,
}

impl<W: Write + Send + 'static> TerminalView<W> {
    /// `mask_input` controls whether echo on stdin is switched off for masked
    /// prompts. Pass `false` when stdin is not the terminal the user types in.
    pub fn new(out: W, mask_input: bool) -> Self {
        Self {
            out,
            mask_input,
            echo: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            debug!("Terminal write failed: {e}");
        }
    }
}

fn hint(kind: PromptKind) -> &'static str {
    match kind {
        PromptKind::Confirm => " [y/n] ",
        PromptKind::Masked => " (input hidden) ",
        PromptKind::FreeText => " ",
    }
}

impl<W: Write + Send + 'static> PromptView for TerminalView<W> {
    fn show(&mut self, prompt: &ActivePrompt) {
        let line = format!("{}{}", prompt.text.trim_end(), hint(prompt.kind));
        self.emit(&line);
        if prompt.kind == PromptKind::Masked && self.mask_input {
            self.echo = echo::suppress();
        }
    }

    fn set_busy(&mut self, busy: bool) {
        if busy {
            self.emit("...\n");
        } else {
            self.emit("not accepted, try again: ");
        }
    }

    fn hide(&mut self, _id: &str) {
        // Dropping the guard restores echo.
        self.echo = None;
    }
}

/// Map what the user typed to the reply the host expects.
///
/// Confirm prompts accept `y`/`yes`/`n`/`no` in any case and reply `yes` or
/// `no`. Everything else is passed through as typed.
pub fn normalize_answer(kind: PromptKind, line: &str) -> String {
    if kind == PromptKind::Confirm {
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return "yes".to_string(),
            "n" | "no" | "" => return "no".to_string(),
            _ => {}
        }
    }
    line.to_string()
}

/// Read answers from `input` until EOF, then cancel the open prompt.
///
/// Lines typed while no prompt is open are dropped.
pub fn spawn_input<R>(input: R, relay: RelayHandle) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = input.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(snapshot) = relay.snapshot().await else {
                        break;
                    };
                    let Some(current) = snapshot.current else {
                        debug!("No prompt open, ignoring input line");
                        continue;
                    };
                    if !relay.submit(normalize_answer(current.kind, &line)).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Input closed, cancelling open prompt");
                    relay.cancel().await;
                    break;
                }
                Err(e) => {
                    debug!("Input read failed: {e}");
                    relay.cancel().await;
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
mod echo {
    use std::io::stdin;
    use std::os::fd::AsFd;

    use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
    use tracing::debug;

    /// Saved terminal settings; restored on drop.
    pub struct Suppressed(Termios);

    /// Turn off echo on stdin. `None` when stdin is not a terminal.
    pub fn suppress() -> Option<Suppressed> {
        let stdin = stdin();
        let saved = termios::tcgetattr(stdin.as_fd())
            .inspect_err(|e| debug!("tcgetattr: {e}"))
            .ok()?;
        let mut quiet = saved.clone();
        quiet.local_flags &= !LocalFlags::ECHO;
        quiet.local_flags |= LocalFlags::ECHONL;
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &quiet)
            .inspect_err(|e| debug!("tcsetattr: {e}"))
            .ok()?;
        Some(Suppressed(saved))
    }

    impl Drop for Suppressed {
        fn drop(&mut self) {
            if let Err(e) = termios::tcsetattr(stdin().as_fd(), SetArg::TCSANOW, &self.0) {
                debug!("Restoring terminal echo failed: {e}");
            }
        }
    }
}

#[cfg(not(unix))]
mod echo {
    pub struct Suppressed;

    pub fn suppress() -> Option<Suppressed> {
        None
    }
}
