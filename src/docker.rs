use crate::error::{ProcessErrorDetails, SolverError};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Every `docker` CLI invocation goes through this seam.
///
/// `env_overrides` is layered on top of the inherited environment of the
/// docker client process. When `timeout` is set and the command has not
/// exited by then, the process is killed and an `io::ErrorKind::TimedOut`
/// error is returned.
pub trait DockerRunner {
    fn run(
        &self,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(
        &self,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new("docker");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn()?;
        // Drain both pipes off-thread so a chatty container log cannot fill
        // the pipe buffer and stall the wait below.
        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let status = match timeout {
            Some(limit) => wait_with_deadline(&mut child, limit)?,
            None => child.wait()?,
        };
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        let status_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
        })
    }
}

fn spawn_pipe_reader<P: Read + Send + 'static>(pipe: Option<P>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<ExitStatus, io::Error> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("command did not exit within {}s", limit.as_secs()),
            ));
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Renders `docker <args>` as a line that can be pasted into a POSIX shell.
pub fn render_docker_command(args: &[String]) -> String {
    let words = std::iter::once("docker").chain(args.iter().map(String::as_str));
    // `try_join` only fails on a NUL byte.
    shlex::try_join(words).unwrap_or_else(|_| format!("docker {}", args.join(" ")))
}

fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some(
                "Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("unable to find image")
        || lower.contains("no such image")
        || lower.contains("manifest unknown")
        || lower.contains("repository does not exist")
    {
        return (
            "docker_image_not_found".to_string(),
            Some(
                "The assistant image is missing. Pull it with `docker pull <image>` or fix docker.image in config."
                    .to_string(),
            ),
        );
    }

    if lower.contains("mounts denied") || lower.contains("is not shared from the host") {
        return (
            "docker_mount_denied".to_string(),
            Some(
                "Docker refused a bind mount. Share the repository and cache directories with Docker and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` for private images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Runs `docker <args>` and turns spawn failures, timeouts, and non-zero exits
/// into `SolverError`s carrying classified details.
pub fn execute_docker<R: DockerRunner>(
    runner: &R,
    args: &[String],
    env_overrides: &BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> Result<CommandOutput, SolverError> {
    let command = render_docker_command(args);
    let cmd_output = runner.run(args, env_overrides, timeout).map_err(|err| {
        if err.kind() == io::ErrorKind::TimedOut {
            return SolverError::Timeout {
                command: command.clone(),
                timeout_sec: timeout.map(|limit| limit.as_secs()).unwrap_or_default(),
            };
        }
        let details = docker_spawn_error_details(&err, &command);
        SolverError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr)
            .trim()
            .to_string();
        let (error_code, hint) = classify_docker_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(SolverError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() {
                    None
                } else {
                    Some(stderr)
                },
            },
        });
    }
    Ok(cmd_output)
}
