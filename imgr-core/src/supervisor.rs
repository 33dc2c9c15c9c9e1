//! Runs one copy-tool invocation to completion.
//!
//! The child's status stream is read byte by byte on a reader thread and
//! handed over line by line, so classification and cancellation polling
//! happen while the tool is still running. The other stream is drained on a
//! second thread so the child never blocks on a full pipe.
use crate::cancel::CancelToken;
use crate::classify::{LineClassifier, StreamClassifier, tidy_line};
use crate::error::SupervisorError;
use crate::method::Stream;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Exit code reported when the tool could not be run at all. Real exit codes
/// are never negative, so this cannot be confused with a tool's own status.
pub const SYNTHETIC_FAILURE_EXIT_CODE: i32 = -99;

// How long the supervisor waits for a line before polling for cancellation
// and the deadline anyway.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The result of one copy-tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    /// The argument vector joined with spaces, for the audit trail.
    pub command_line: String,
    pub error_detected: bool,
    pub interrupted: bool,
    /// The deadline expired and the child was killed.
    pub timed_out: bool,
    /// Last read-error tally of a rescue-style tool.
    pub error_count: Option<u64>,
}

/// Coarse classification of a [`ProcessOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Clean,
    Failed,
    Interrupted,
    TimedOut,
}

impl ProcessOutcome {
    /// The outcome recorded when the tool could not be launched or
    /// supervised.
    pub fn failed_to_run(command_line: impl Into<String>) -> Self {
        Self {
            exit_code: SYNTHETIC_FAILURE_EXIT_CODE,
            command_line: command_line.into(),
            error_detected: false,
            interrupted: false,
            timed_out: false,
            error_count: None,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        if self.timed_out {
            OutcomeKind::TimedOut
        } else if self.interrupted {
            OutcomeKind::Interrupted
        } else if self.exit_code != 0 || self.error_detected {
            OutcomeKind::Failed
        } else {
            OutcomeKind::Clean
        }
    }

    pub fn is_clean(&self) -> bool {
        self.kind() == OutcomeKind::Clean
    }
}

enum ReaderEvent {
    Line(String),
    Failed(io::Error),
}

/// Drives a single external process and classifies its output.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    deadline: Option<Duration>,
}

impl ProcessSupervisor {
    /// A supervisor that waits for the child for as long as it takes.
    pub fn new() -> Self {
        Self::default()
    }

    /// A supervisor that kills the child once `deadline` has passed.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Runs `argv` (program first) to completion.
    ///
    /// Lines of the `watched` stream are tidied, classified with
    /// `classifier`, logged and passed to `on_line`. After every line, and
    /// whenever the tool stays silent for a moment, `cancel` is polled; a
    /// request sends SIGINT to the child once and the supervisor keeps
    /// draining until the child exits.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::SpawnFailed`] if the program cannot be
    /// started, [`SupervisorError::IoFailed`] if its output cannot be read
    /// and [`SupervisorError::WaitFailed`] if its exit status cannot be
    /// collected. Tool failures are not errors; they are
    /// reported in the returned [`ProcessOutcome`].
    pub fn run<F>(
        &self,
        argv: &[String],
        watched: Stream,
        classifier: LineClassifier,
        cancel: &CancelToken,
        mut on_line: F,
    ) -> Result<ProcessOutcome, SupervisorError>
    where
        F: FnMut(&str),
    {
        let Some((program, args)) = argv.split_first() else {
            return Err(SupervisorError::SpawnFailed {
                tool: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"),
            });
        };
        let tool = tool_name(program);
        let command_line = argv.join(" ");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: a terminal Ctrl+C reaches the caller only,
            // and the tool gets the single SIGINT sent by `poll_cancel`.
            .process_group(0)
            .spawn()
            .map_err(|source| SupervisorError::SpawnFailed {
                tool: tool.clone(),
                source,
            })?;

        let (watched_pipe, other_pipe) = match take_pipes(&mut child, watched) {
            Ok(pipes) => pipes,
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SupervisorError::IoFailed { tool, source });
            }
        };

        let (tx, rx) = mpsc::channel();
        let reader = spawn_line_reader(watched_pipe, tx);
        let drainer = spawn_drainer(other_pipe, tool.clone());

        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut lines = StreamClassifier::new(classifier);
        let mut interrupted = false;
        let mut timed_out = false;
        let mut read_error = None;

        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(ReaderEvent::Line(raw)) => {
                    if let Some(line) = lines.classify(&raw) {
                        info!("{line}");
                        on_line(&line);
                    }
                    poll_cancel(&child, cancel, &tool, &mut interrupted);
                }
                Ok(ReaderEvent::Failed(e)) => read_error = Some(e),
                Err(RecvTimeoutError::Timeout) => {
                    poll_cancel(&child, cancel, &tool, &mut interrupted);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !timed_out && deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("*** {tool} did not finish in time, killing it ***");
                if let Err(e) = child.kill() {
                    debug!("kill {tool}: {e}");
                }
                timed_out = true;
            }

            // A killed child may leave grandchildren holding the pipe open;
            // stop waiting for end-of-stream once the child itself is gone.
            if timed_out && matches!(child.try_wait(), Ok(Some(_))) {
                break;
            }
        }

        // A request that arrived after the last poll still counts. The child
        // has exited but is not reaped yet, so signalling it is harmless.
        if !timed_out {
            poll_cancel(&child, cancel, &tool, &mut interrupted);
        }

        let status = child.wait().map_err(|source| SupervisorError::WaitFailed {
            tool: tool.clone(),
            source,
        })?;

        if !timed_out {
            let _ = reader.join();
            let _ = drainer.join();
        }

        if let Some(source) = read_error {
            return Err(SupervisorError::IoFailed { tool, source });
        }

        let outcome = ProcessOutcome {
            exit_code: exit_code_of(status),
            command_line,
            error_detected: lines.error_detected(),
            interrupted,
            timed_out,
            error_count: lines.error_count(),
        };

        info!("Command: {}", outcome.command_line);
        if outcome.exit_code == 0 {
            info!("{tool} status: {}", outcome.exit_code);
        } else {
            error!("{tool} status: {}", outcome.exit_code);
        }
        info!("{tool} errorFlag: {}", outcome.error_detected);

        Ok(outcome)
    }
}

fn tool_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string())
}

type Pipe = Box<dyn Read + Send>;

fn take_pipes(child: &mut Child, watched: Stream) -> io::Result<(Pipe, Pipe)> {
    let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "child pipe not captured");
    let stdout: Pipe = Box::new(child.stdout.take().ok_or_else(missing)?);
    let stderr: Pipe = Box::new(child.stderr.take().ok_or_else(missing)?);

    Ok(match watched {
        Stream::Stdout => (stdout, stderr),
        Stream::Stderr => (stderr, stdout),
    })
}

/// Reads `source` one byte at a time and sends every completed line,
/// terminator included. A trailing line without terminator is sent when the
/// stream ends. Dropping the sender signals end-of-stream.
fn spawn_line_reader(source: Pipe, tx: Sender<ReaderEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match reader.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        let text = String::from_utf8_lossy(&line).into_owned();
                        line.clear();
                        if tx.send(ReaderEvent::Line(text)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.send(ReaderEvent::Failed(e));
                    return;
                }
            }
        }

        if !line.is_empty() {
            let text = String::from_utf8_lossy(&line).into_owned();
            let _ = tx.send(ReaderEvent::Line(text));
        }
    })
}

fn spawn_drainer(source: Pipe, tool: String) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = tidy_line(&String::from_utf8_lossy(&buf));
                    if !line.is_empty() {
                        debug!("{tool}: {line}");
                    }
                }
            }
        }
    })
}

fn poll_cancel(child: &Child, cancel: &CancelToken, tool: &str, interrupted: &mut bool) {
    if !cancel.take() {
        return;
    }
    *interrupted = true;
    warn!("*** {tool} execution interrupted by user ***");

    let pid = Pid::from_raw(child.id() as i32);
    if let Err(errno) = kill(pid, Signal::SIGINT) {
        warn!("could not send SIGINT to {tool}: {errno}");
    }
}

/// The exit code as the OS reports it; a child killed by a signal reports
/// `128 + signal`, like a shell would.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    if let Some(signal) = status.signal() {
        return 128 + signal;
    }
    SYNTHETIC_FAILURE_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn run_script(
        script: &str,
        stream: Stream,
        classifier: LineClassifier,
    ) -> (ProcessOutcome, Vec<String>) {
        let mut lines = Vec::new();
        let outcome = ProcessSupervisor::new()
            .run(&sh(script), stream, classifier, &CancelToken::new(), |l| {
                lines.push(l.to_string())
            })
            .expect("supervise sh");
        (outcome, lines)
    }

    #[test]
    fn clean_run_reports_zero_and_no_errors() {
        let (outcome, lines) = run_script(
            "echo '1000+0 records in' >&2; echo '1000+0 records out' >&2",
            Stream::Stderr,
            LineClassifier::ErrorKeyword,
        );

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.error_detected);
        assert!(!outcome.interrupted);
        assert!(outcome.is_clean());
        assert_eq!(lines, ["1000+0 records in", "1000+0 records out"]);
        assert!(outcome.command_line.starts_with("sh -c echo"));
    }

    #[test]
    fn error_keyword_on_watched_stream_only() {
        let (outcome, lines) = run_script(
            "echo 'some error on stdout'; echo 'copied' >&2",
            Stream::Stderr,
            LineClassifier::ErrorKeyword,
        );

        assert!(!outcome.error_detected);
        assert_eq!(lines, ["copied"]);
    }

    #[test]
    fn trailing_partial_line_is_classified() {
        let (outcome, lines) = run_script(
            "printf 'reading\\ndd: Input/output ERROR' >&2",
            Stream::Stderr,
            LineClassifier::ErrorKeyword,
        );

        assert!(outcome.error_detected);
        assert_eq!(lines, ["reading", "dd: Input/output ERROR"]);
    }

    #[test]
    fn rescue_error_count_is_parsed() {
        let (outcome, _) = run_script(
            "printf '\\033[A\\033[Arescued: 12 kB, errsize: 1024 B, errors: 3\\r\\n'",
            Stream::Stdout,
            LineClassifier::RescueErrorCount,
        );

        assert_eq!(outcome.error_count, Some(3));
        assert!(outcome.error_detected);
        assert_eq!(outcome.kind(), OutcomeKind::Failed);
    }

    #[test]
    fn stream_without_tally_has_no_errors() {
        let (outcome, _) = run_script(
            "echo 'GNU ddrescue 1.27'; echo 'Finished'",
            Stream::Stdout,
            LineClassifier::RescueErrorCount,
        );

        assert_eq!(outcome.error_count, None);
        assert!(!outcome.error_detected);
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let (outcome, _) = run_script("exit 3", Stream::Stderr, LineClassifier::ErrorKeyword);
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.kind(), OutcomeKind::Failed);
    }

    #[test]
    fn killed_child_reports_signal_exit_code() {
        let (outcome, _) = run_script("kill -TERM $$", Stream::Stderr, LineClassifier::ErrorKeyword);
        assert_eq!(outcome.exit_code, 128 + 15);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let argv = vec!["/nonexistent/imgr-copy-tool".to_string()];
        let result = ProcessSupervisor::new().run(
            &argv,
            Stream::Stdout,
            LineClassifier::ErrorKeyword,
            &CancelToken::new(),
            |_| {},
        );

        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }

    #[test]
    fn cancellation_interrupts_once_and_drains() {
        let cancel = CancelToken::new();
        let requester = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            requester.request();
        });

        let mut lines = Vec::new();
        let outcome = ProcessSupervisor::with_deadline(Duration::from_secs(20))
            .run(
                &sh("trap 'echo stopping; exit 130' INT; while :; do echo tick; sleep 0.05; done"),
                Stream::Stdout,
                LineClassifier::ErrorKeyword,
                &cancel,
                |l| lines.push(l.to_string()),
            )
            .unwrap();

        assert!(outcome.interrupted);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, 130);
        assert_eq!(outcome.kind(), OutcomeKind::Interrupted);
        assert_eq!(lines.last().map(String::as_str), Some("stopping"));
        assert!(!cancel.is_requested());
    }

    #[test]
    fn request_just_before_exit_is_not_lost() {
        let cancel = CancelToken::new();
        cancel.request();

        let outcome = ProcessSupervisor::new()
            .run(&sh("exit 0"), Stream::Stderr, LineClassifier::ErrorKeyword, &cancel, |_| {})
            .unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.kind(), OutcomeKind::Interrupted);
        assert!(!cancel.is_requested());
    }

    #[test]
    fn request_during_last_silent_moment_is_not_lost() {
        let cancel = CancelToken::new();
        let requester = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(250));
            requester.request();
        });

        let outcome = ProcessSupervisor::new()
            .run(
                &sh("echo start >&2; sleep 0.27"),
                Stream::Stderr,
                LineClassifier::ErrorKeyword,
                &cancel,
                |_| {},
            )
            .unwrap();

        assert!(outcome.interrupted);
        assert!(!cancel.is_requested());
    }

    #[test]
    fn tool_runs_in_its_own_process_group() {
        let mut lines = Vec::new();
        ProcessSupervisor::new()
            .run(
                &sh("cut -d' ' -f5 /proc/$$/stat"),
                Stream::Stdout,
                LineClassifier::ErrorKeyword,
                &CancelToken::new(),
                |l| lines.push(l.to_string()),
            )
            .unwrap();

        let ours = nix::unistd::getpgrp().as_raw().to_string();
        assert_eq!(lines.len(), 1);
        assert_ne!(lines[0], ours);
    }

    #[test]
    fn deadline_kills_a_child_ignoring_interrupts() {
        let outcome = ProcessSupervisor::with_deadline(Duration::from_millis(500))
            .run(
                &sh("trap '' INT; while :; do sleep 0.05; done"),
                Stream::Stdout,
                LineClassifier::ErrorKeyword,
                &CancelToken::new(),
                |_| {},
            )
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.kind(), OutcomeKind::TimedOut);
        assert_eq!(outcome.exit_code, 128 + 9);
    }

    #[test]
    fn synthetic_outcome_is_a_failure() {
        let outcome = ProcessOutcome::failed_to_run("dd if=/dev/sdz");
        assert_eq!(outcome.exit_code, SYNTHETIC_FAILURE_EXIT_CODE);
        assert!(!outcome.is_clean());
    }
}
