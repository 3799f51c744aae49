//! Spawning node binaries and supervising their output.
//!
//! Each launched process gets a supervisor task that merges stdout and
//! stderr into a per-run log file and appends exactly one status line when
//! the process closes.

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use moonwall_foundation_core::{Cleanup, DynError, LaunchError};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader, BufWriter},
    process::{Child, Command},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

pub const DEFAULT_LOG_DIRECTORY: &str = "tmp/node_logs";
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub command: String,
    pub args: Vec<String>,
    pub name: String,
    pub log_directory: PathBuf,
    /// How long a terminated process may take to exit before it is killed.
    pub kill_grace: Duration,
    /// Also emit every output line as a `moonwall::node` trace event.
    pub echo_output: bool,
}

impl LaunchOptions {
    pub fn new(command: impl Into<String>, args: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            name: name.into(),
            log_directory: PathBuf::from(DEFAULT_LOG_DIRECTORY),
            kill_grace: DEFAULT_KILL_GRACE,
            echo_output: false,
        }
    }

    #[must_use]
    pub fn with_log_directory(mut self, log_directory: impl Into<PathBuf>) -> Self {
        self.log_directory = log_directory.into();
        self
    }

    #[must_use]
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    #[must_use]
    pub fn with_output_echo(mut self, echo_output: bool) -> Self {
        self.echo_output = echo_output;
        self
    }
}

/// How a supervised process closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessExit {
    Killed,
    Exited(i32),
    Signaled(i32),
    ClosedUnexpectedly,
}

impl ProcessExit {
    fn classify(status: io::Result<ExitStatus>, intentional: bool) -> Self {
        if intentional {
            return Self::Killed;
        }
        let Ok(status) = status else {
            return Self::ClosedUnexpectedly;
        };
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt as _;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::ClosedUnexpectedly
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Killed => f.write_str("process killed"),
            Self::Exited(code) => write!(f, "process exited with code {code}"),
            Self::Signaled(signal) => write!(f, "process terminated by signal {signal}"),
            Self::ClosedUnexpectedly => f.write_str("process closed unexpectedly"),
        }
    }
}

/// Caller-facing view of a launched process.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    pid: u32,
    command: String,
    args: Vec<String>,
    log_path: PathBuf,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    #[must_use]
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    /// Resolves once the supervisor has written the status line.
    pub async fn wait_for_exit(&self) -> Option<ProcessExit> {
        let mut exit = self.exit.clone();
        exit.wait_for(Option::is_some).await.ok().and_then(|value| *value)
    }
}

pub struct Launched {
    pub process: ProcessHandle,
    pub cleanup: Cleanup,
}

/// `<directory>/<command basename>_node_<port hint>_<pid>.log`
#[must_use]
pub fn log_file_path(directory: &Path, command: &str, args: &[String], pid: u32) -> PathBuf {
    let basename = Path::new(command)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(command);
    let port = args
        .iter()
        .find_map(|arg| {
            let (flag, value) = arg.split_once('=')?;
            flag.contains("port").then_some(value)
        })
        .unwrap_or("default");
    directory.join(format!("{basename}_node_{port}_{pid}.log"))
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

pub async fn launch(options: LaunchOptions) -> Result<Launched, LaunchError> {
    let LaunchOptions {
        command,
        args,
        name,
        log_directory,
        kill_grace,
        echo_output,
    } = options;

    fs::create_dir_all(&log_directory)
        .await
        .map_err(|source| LaunchError::LogDirectory {
            path: log_directory.clone(),
            source,
        })?;

    let mut child = Command::new(&command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            command: command.clone(),
            args: args.clone(),
            source,
        })?;

    let Some(pid) = child.id() else {
        return Err(LaunchError::MissingPid { command, args });
    };

    let log_path = log_file_path(&log_directory, &command, &args, pid);
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .map(BufWriter::new)
        .map_err(|source| LaunchError::LogFile {
            path: log_path.clone(),
            source,
        })?;
    let header = format!(
        "{} [moonwall] launched {name}: {command} {} (pid {pid})\n",
        timestamp(),
        args.join(" ")
    );
    if let Err(error) = log.write_all(header.as_bytes()).await {
        warn!(%error, path = %log_path.display(), "failed to write log header");
    }

    info!(%name, %command, pid, log = %log_path.display(), "process launched");

    let intentional = Arc::new(AtomicBool::new(false));
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    let lines = forward_output(&mut child);
    let supervisor = tokio::spawn(supervise(Supervised {
        child,
        pid,
        echo: echo_output.then(|| name.clone()),
        log,
        lines,
        kill: kill_rx,
        intentional: Arc::clone(&intentional),
        kill_grace,
        exit: exit_tx,
    }));

    let process = ProcessHandle {
        pid,
        command,
        args,
        log_path,
        exit: exit_rx,
    };
    let cleanup = Cleanup::new(format!("process {name} (pid {pid})"), move || {
        terminate(pid, intentional, kill_tx, supervisor)
    });

    Ok(Launched { process, cleanup })
}

async fn terminate(
    pid: u32,
    intentional: Arc<AtomicBool>,
    kill: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
) -> Result<(), DynError> {
    intentional.store(true, Ordering::SeqCst);
    if kill.send(()).is_err() {
        debug!(pid, "process already closed");
    }
    supervisor.await?;
    Ok(())
}

fn forward_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx));
    }
    rx
}

async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(error) => {
                debug!(%error, "stopped reading process output");
                return;
            }
        }
    }
}

struct Supervised {
    child: Child,
    pid: u32,
    echo: Option<String>,
    log: BufWriter<File>,
    lines: mpsc::UnboundedReceiver<String>,
    kill: oneshot::Receiver<()>,
    intentional: Arc<AtomicBool>,
    kill_grace: Duration,
    exit: watch::Sender<Option<ProcessExit>>,
}

async fn supervise(mut task: Supervised) {
    let mut output_open = true;
    let status = loop {
        tokio::select! {
            line = task.lines.recv(), if output_open => match line {
                Some(line) => record_line(&mut task.log, task.echo.as_deref(), &line).await,
                None => output_open = false,
            },
            status = task.child.wait() => break status,
            _ = &mut task.kill => {
                break stop_child(&mut task.child, task.pid, task.kill_grace).await;
            }
        }
    };

    if output_open {
        let drain = async {
            while let Some(line) = task.lines.recv().await {
                record_line(&mut task.log, task.echo.as_deref(), &line).await;
            }
        };
        if timeout(LOG_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(pid = task.pid, "output still open after exit; closing log");
        }
    }

    let exit = ProcessExit::classify(status, task.intentional.load(Ordering::SeqCst));
    write_line(&mut task.log, &format!("{} [moonwall] {exit}", timestamp())).await;
    if let Err(error) = task.log.flush().await {
        warn!(pid = task.pid, %error, "failed to flush process log");
    }

    match exit {
        ProcessExit::Killed | ProcessExit::Exited(0) => {
            info!(pid = task.pid, %exit, "process closed");
        }
        _ => warn!(pid = task.pid, %exit, "process closed"),
    }
    task.exit.send_replace(Some(exit));
}

async fn record_line(log: &mut BufWriter<File>, echo: Option<&str>, line: &str) {
    if let Some(node) = echo {
        info!(target: "moonwall::node", %node, "{line}");
    }
    write_line(log, line).await;
}

async fn write_line(log: &mut BufWriter<File>, line: &str) {
    let result = async {
        log.write_all(line.as_bytes()).await?;
        log.write_all(b"\n").await
    }
    .await;
    if let Err(error) = result {
        debug!(%error, "failed to write process output");
    }
}

async fn stop_child(child: &mut Child, pid: u32, grace: Duration) -> io::Result<ExitStatus> {
    send_terminate(pid);
    if let Ok(status) = timeout(grace, child.wait()).await {
        return status;
    }
    warn!(pid, grace_ms = grace.as_millis(), "process ignored termination; killing");
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %errno, "failed to deliver SIGTERM");
    }
}

#[cfg(not(unix))]
const fn send_terminate(_pid: u32) {}
