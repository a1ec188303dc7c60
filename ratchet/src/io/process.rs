//! Child processes for the command-backed capabilities: bounded output,
//! wall-clock timeout, placeholder substitution in configured argv.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded past the output limit, both streams together.
    pub truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout then stderr, with a note when anything was cut.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if self.truncated > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        if self.timed_out {
            text.push_str("\n[command timed out]\n");
        }
        text
    }
}

/// Keep at most `limit` bytes of `text`, cut on a char boundary, noting how
/// much was dropped.
pub fn cap_text(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n[output truncated {dropped} bytes]\n"));
    text
}

/// Build a command from a configured argv, replacing `{key}` placeholders.
pub fn command_from_argv(argv: &[String], workdir: &Path, vars: &[(&str, &str)]) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let expand = |arg: &String| {
        vars.iter()
            .fold(arg.clone(), |acc, (key, value)| acc.replace(&format!("{{{key}}}"), value))
    };
    let mut cmd = Command::new(expand(program));
    cmd.args(args.iter().map(expand)).current_dir(workdir);
    Ok(cmd)
}

/// Run `cmd` to completion or until `timeout`, feeding `stdin` and keeping at
/// most `output_limit` bytes of each stream. Pipes are drained on separate
/// threads so a chatty child can never block on a full pipe.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd.spawn().with_context(|| format!("spawn {program}"))?;
    debug!(%program, pid = child.id(), "spawned");

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout = drain(stdout, output_limit);
    let stderr = drain(stderr, output_limit);

    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading its input is not an error here;
        // its exit status says what happened.
        if let Err(err) = pipe.write_all(input) {
            debug!(%err, "child closed stdin early");
        }
    }

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(%program, timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    let (stdout, out_cut) = join(stdout).context("collect stdout")?;
    let (stderr, err_cut) = join(stderr).context("collect stderr")?;
    let truncated = out_cut + err_cut;
    if truncated > 0 {
        warn!(%program, truncated, "output truncated");
    }
    debug!(%program, exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        truncated,
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R, limit: usize) -> JoinHandle<Result<(Vec<u8>, usize)>> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).context("read output")?;
            if n == 0 {
                return Ok((kept, dropped));
            }
            let room = limit.saturating_sub(kept.len()).min(n);
            kept.extend_from_slice(&chunk[..room]);
            dropped += n - room;
        }
    })
}

fn join(handle: JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let out = run_command(sh("cat; echo done"), Some(b"hello\n"), Duration::from_secs(10), 1000)
            .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_text(), "hello\ndone\n");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_command(sh("printf 'abcdefghij'"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.truncated, 6);
        assert!(out.combined_text().contains("truncated 6 bytes"));
    }

    #[test]
    fn cap_text_cuts_on_char_boundary() {
        assert_eq!(cap_text("short".to_string(), 10), "short");
        let capped = cap_text("héllo".to_string(), 2);
        assert!(capped.starts_with("h\n[output truncated 5 bytes]"), "{capped}");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(sh("sleep 5"), None, Duration::from_millis(100), 1000).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn argv_placeholders_are_expanded() {
        let argv = vec!["echo".to_string(), "--out={output}".to_string(), "{test}".to_string()];
        let cmd = command_from_argv(&argv, Path::new("."), &[("output", "/tmp/o.json"), ("test", "adds")])
            .expect("command");
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--out=/tmp/o.json", "adds"]);
    }

    #[test]
    fn empty_argv_is_an_error() {
        assert!(command_from_argv(&[], Path::new("."), &[]).is_err());
    }
}
