//! External tool command builder and runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{MediaError, MediaResult};
use crate::progress::{decode_line, TaggedMessage};

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// How long output is still read once the tool has exited.
///
/// A background child that inherited the pipes can hold them open long
/// after the tool itself is gone.
pub const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Builder for external media tool invocations.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Executable name or path
    program: PathBuf,
    /// Arguments in order
    args: Vec<String>,
    /// Extra environment variables
    envs: Vec<(String, String)>,
}

impl ToolCommand {
    /// Create a new command for `program`.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set the input file (`-i`).
    pub fn input(self, path: impl AsRef<Path>) -> Self {
        self.arg("-i").arg(path_arg(path))
    }

    /// Set the output directory (`-o`).
    pub fn output_dir(self, path: impl AsRef<Path>) -> Self {
        self.arg("-o").arg(path_arg(path))
    }

    /// Set the output frame rate (`-f`).
    pub fn fps(self, fps: u32) -> Self {
        self.arg("-f").arg(fps.to_string())
    }

    /// Set the output width (`-w`).
    pub fn width(self, width: u32) -> Self {
        self.arg("-w").arg(width.to_string())
    }

    /// Set the video codec.
    pub fn codec(self, codec: impl Into<String>) -> Self {
        self.arg("--codec").arg(codec)
    }

    /// Set the output extension (`-e`).
    pub fn extension(self, ext: impl Into<String>) -> Self {
        self.arg("-e").arg(ext)
    }

    /// Set the output file name.
    pub fn output_filename(self, name: impl Into<String>) -> Self {
        self.arg("--output-filename").arg(name)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Short tool name for logs and errors.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        self.args.clone()
    }

    /// Resolve the executable (PATH lookup for bare names).
    pub fn resolve_program(&self) -> MediaResult<PathBuf> {
        let has_separator = self.program.components().count() > 1;
        if has_separator {
            if self.program.exists() {
                return Ok(self.program.clone());
            }
            return Err(MediaError::ToolNotFound(self.program.display().to_string()));
        }
        which::which(&self.program).map_err(|_| MediaError::ToolNotFound(self.tool_name()))
    }

    /// Build a tokio command with piped stdout/stderr.
    pub fn to_command(&self) -> MediaResult<Command> {
        let program = self.resolve_program()?;
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

/// Captured output of a finished tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runner for external tools.
#[derive(Debug, Clone, Default)]
pub struct ToolRunner;

impl ToolRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command, failing on non-zero exit.
    pub async fn run(&self, cmd: &ToolCommand) -> MediaResult<ToolOutput> {
        let output = self.output(cmd).await?;
        if output.success() {
            return Ok(output);
        }
        Err(failure(cmd, &output.stderr, output.exit_code))
    }

    /// Run a command and capture its output regardless of exit status.
    pub async fn output(&self, cmd: &ToolCommand) -> MediaResult<ToolOutput> {
        debug!("Running {}: {}", cmd.tool_name(), cmd.build_args().join(" "));
        let mut child = cmd.to_command()?.spawn()?;
        let (stdout, stderr) = take_pipes(&mut child)?;
        let stdout = LineReader::spawn(stdout);
        let stderr = LineReader::spawn(stderr);

        let status = wait(&mut child).await?;
        let deadline = Instant::now() + OUTPUT_GRACE;
        let (stdout, stderr) = tokio::join!(stdout.collect(deadline), stderr.collect(deadline));
        Ok(ToolOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }

    /// Run a command, forwarding decoded protocol messages from stdout.
    ///
    /// Plain stdout lines are traced and dropped. Fails on non-zero exit with
    /// the stderr tail as the message.
    pub async fn run_with_messages<F>(&self, cmd: &ToolCommand, on_message: F) -> MediaResult<()>
    where
        F: Fn(TaggedMessage) + Send + 'static,
    {
        debug!("Running {}: {}", cmd.tool_name(), cmd.build_args().join(" "));
        let mut child = cmd.to_command()?.spawn()?;
        let (stdout, stderr) = take_pipes(&mut child)?;

        let tool = cmd.tool_name();
        let stdout_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                match decode_line(&line) {
                    Some(message) => on_message(message),
                    None => trace!(tool = %tool, "{}", line),
                }
            }
        });
        let stderr_handle = tokio::spawn(collect_tail(stderr));

        let status = wait(&mut child).await;
        let deadline = Instant::now() + OUTPUT_GRACE;
        let (_, stderr_tail) = tokio::join!(
            join_reader(stdout_handle, deadline),
            join_reader(stderr_handle, deadline)
        );

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(failure(cmd, &stderr_tail, status.code()))
        }
    }
}

async fn wait(child: &mut Child) -> MediaResult<std::process::ExitStatus> {
    Ok(child.wait().await?)
}

fn take_pipes(child: &mut Child) -> MediaResult<(tokio::process::ChildStdout, tokio::process::ChildStderr)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| MediaError::internal("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| MediaError::internal("stderr not captured"))?;
    Ok((stdout, stderr))
}

/// Wait for an output reader until `deadline`, then abort it.
///
/// Returns the reader's result, or the default when it had to be aborted.
pub async fn join_reader<T: Default>(mut reader: JoinHandle<T>, deadline: Instant) -> T {
    match tokio::time::timeout_at(deadline, &mut reader).await {
        Ok(result) => result.unwrap_or_default(),
        Err(_) => {
            reader.abort();
            warn!("Tool output still open after exit, abandoning reader");
            T::default()
        }
    }
}

/// Reads a stream line by line into a channel, so lines read so far
/// survive when the reader is abandoned.
struct LineReader {
    task: JoinHandle<()>,
    lines: mpsc::UnboundedReceiver<String>,
}

impl LineReader {
    fn spawn<R>(stream: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, lines) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { task, lines }
    }

    /// Gather lines until the stream closes or `deadline` passes.
    async fn collect(mut self, deadline: Instant) -> String {
        let mut out = String::new();
        loop {
            match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Ok(Some(line)) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                Ok(None) => break,
                Err(_) => {
                    self.task.abort();
                    warn!("Tool output still open after exit, abandoning reader");
                    while let Ok(line) = self.lines.try_recv() {
                        out.push_str(&line);
                        out.push('\n');
                    }
                    break;
                }
            }
        }
        out
    }
}

/// Decode protocol messages from `stream` line by line.
///
/// Lines that are not protocol messages are kept as a tail (last
/// `STDERR_TAIL_LINES` non-empty lines) and returned once the stream closes.
pub async fn decode_stream<R, F>(stream: R, mut on_message: F) -> String
where
    R: AsyncRead + Unpin,
    F: FnMut(TaggedMessage),
{
    let mut reader = BufReader::new(stream).lines();
    let mut tail: std::collections::VecDeque<String> = std::collections::VecDeque::new();
    while let Ok(Some(line)) = reader.next_line().await {
        match decode_line(&line) {
            Some(message) => on_message(message),
            None => push_tail(&mut tail, line),
        }
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Read a stream to the end, keeping only the last lines.
pub async fn collect_tail<R>(stream: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream).lines();
    let mut tail: std::collections::VecDeque<String> = std::collections::VecDeque::new();
    while let Ok(Some(line)) = reader.next_line().await {
        push_tail(&mut tail, line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

fn push_tail(tail: &mut std::collections::VecDeque<String>, line: String) {
    if line.trim().is_empty() {
        return;
    }
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

/// Build the error for a failed invocation. The stderr text becomes the message.
pub fn failure(cmd: &ToolCommand, stderr: &str, exit_code: Option<i32>) -> MediaError {
    let stderr = stderr.trim();
    let message = if stderr.is_empty() {
        match exit_code {
            Some(code) => format!("{} exited with status {}", cmd.tool_name(), code),
            None => format!("{} was terminated by a signal", cmd.tool_name()),
        }
    } else {
        stderr.to_string()
    };
    MediaError::tool_failed(cmd.tool_name(), message, exit_code)
}

fn path_arg(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().into_owned()
}
