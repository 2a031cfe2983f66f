//! External process invocation with a wall-clock limit.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// A fully-specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Executable name or path.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Input file the command reads.
    pub source: PathBuf,
    /// Destination layer (`schema.table`) the command writes.
    pub layer: String,
}

impl ToolInvocation {
    /// Shell-like rendering for logs. Not escaped; never pass it to a shell.
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        for (key, value) in &self.env {
            line.push_str(&format!("{key}={value} "));
        }
        line.push_str(&self.program.display().to_string());
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push_str(&format!("'{arg}'"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// What a finished (or killed) process left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("cannot start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("lost track of {}: {source}", program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process exceeded its limit and was killed; `output` holds what it wrote.
    #[error("{} timed out after {:?}", program.display(), output.elapsed)]
    TimedOut { program: PathBuf, output: ToolOutput },
}

/// Runs a [`ToolInvocation`] to completion.
pub trait ToolInvoker: Send + Sync {
    fn invoke(
        &self,
        invocation: &ToolInvocation,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, InvokeError>;
}

impl<F> ToolInvoker for F
where
    F: Fn(&ToolInvocation, Option<Duration>) -> Result<ToolOutput, InvokeError> + Send + Sync,
{
    fn invoke(
        &self,
        invocation: &ToolInvocation,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, InvokeError> {
        self(invocation, timeout)
    }
}

/// [`ToolInvoker`] that spawns a real child process.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    poll_interval: Duration,
    output_grace: Duration,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            output_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long to keep collecting output once the process is gone.
    ///
    /// Descendants that inherited the pipes can hold them open past the exit of the tool.
    pub fn with_output_grace(mut self, grace: Duration) -> Self {
        self.output_grace = grace;
        self
    }

    fn wait(
        &self,
        child: &mut Child,
        started: Instant,
        timeout: Option<Duration>,
    ) -> io::Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Ok(None);
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl ToolInvoker for ProcessInvoker {
    fn invoke(
        &self,
        invocation: &ToolInvocation,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, InvokeError> {
        let program = invocation.program.clone();
        let started = Instant::now();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout can take down every descendant.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);
        let mut child = command
            .spawn()
            .map_err(|source| InvokeError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait(&mut child, started, timeout) {
            Ok(status) => status,
            Err(source) => {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(InvokeError::Wait { program, source });
            }
        };

        let timed_out = status.is_none();
        let status = match status {
            Some(status) => status,
            None => {
                warn!(program = %program.display(), "process exceeded its time limit; killing");
                kill_tree(&mut child);
                child
                    .wait()
                    .map_err(|source| InvokeError::Wait {
                        program: program.clone(),
                        source,
                    })?
            }
        };

        let deadline = Instant::now() + self.output_grace;
        let output = ToolOutput {
            exit_code: status.code(),
            stdout: collect(stdout, deadline),
            stderr: collect(stderr, deadline),
            elapsed: started.elapsed(),
        };
        if timed_out {
            return Err(InvokeError::TimedOut { program, output });
        }
        Ok(output)
    }
}

// Kill the child's process group, falling back to the child alone.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let killed = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        if killed {
            return;
        }
        debug!(pid = child.id(), "process group kill failed; killing the child only");
    }
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill failed; process may have just exited");
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
        rx
    })
}

// Output read before `deadline`; a reader still blocked after it is abandoned.
fn collect(output: Option<Receiver<String>>, deadline: Instant) -> String {
    output
        .and_then(|rx| {
            rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                .ok()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(program: &str, args: &[&str]) -> ToolInvocation {
        ToolInvocation {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: vec![("PG_USE_COPY".into(), "YES".into())],
            source: PathBuf::from("in.csv"),
            layer: "cdb_importer.t1".into(),
        }
    }

    #[test]
    fn command_line_quotes_arguments_with_spaces() {
        let inv = invocation("ogr2ogr", &["-f", "PostgreSQL", "PG:host=h user=u"]);
        assert_eq!(
            inv.command_line(),
            "PG_USE_COPY=YES ogr2ogr -f PostgreSQL 'PG:host=h user=u'"
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = ProcessInvoker::new()
            .invoke(&invocation("/definitely/not/here/ogr2ogr", &[]), None)
            .unwrap_err();
        assert!(matches!(err, InvokeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn output_and_exit_code_are_captured() {
        let out = ProcessInvoker::new()
            .invoke(&invocation("sh", &["-c", "echo out; echo err >&2; exit 3"]), None)
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[test]
    fn slow_process_is_killed_at_the_limit() {
        let started = Instant::now();
        let err = ProcessInvoker::new()
            .invoke(&invocation("sleep", &["5"]), Some(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, InvokeError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_does_not_wait_for_descendants_holding_the_pipes() {
        let started = Instant::now();
        let err = ProcessInvoker::new()
            .invoke(
                &invocation("sh", &["-c", "sleep 5; echo done"]),
                Some(Duration::from_millis(200)),
            )
            .unwrap_err();
        match err {
            InvokeError::TimedOut { output, .. } => assert!(!output.stdout.contains("done")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn lingering_background_child_does_not_block_a_finished_tool() {
        let started = Instant::now();
        let out = ProcessInvoker::new()
            .with_output_grace(Duration::from_millis(300))
            .invoke(&invocation("sh", &["-c", "echo early; sleep 5 & exit 0"]), None)
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
