//! One-shot container lifecycle: run, wait, stop, collect logs, remove.
//!
//! A launch owns exactly one container for its whole duration. The
//! `ContainerGuard` holds the container id and makes sure the container is
//! stopped and removed on every exit path, including a panic unwinding
//! through `Launcher::launch`.

use crate::config::{expand_path, Config};
use crate::docker::{execute_docker, CommandOutput, DockerRunner};
use crate::env::EnvSnapshot;
use crate::error::SolverError;
use crate::sanitize::LogSanitizer;
use crate::summarize::Summarizer;
use chrono::Utc;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const SHELL: &str = "/bin/bash";

/// Headroom on top of the stop grace period for every post-wait docker call.
const DOCKER_COMMAND_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub repo_dir: PathBuf,
    pub model_name: String,
    pub background: String,
    pub test_command: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub image: String,
    pub repo_mount: String,
    pub cache_dir: PathBuf,
    pub cache_mount: String,
    pub stop_grace_sec: u64,
    pub venv_activate: String,
    pub driver_script: String,
}

impl LaunchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            image: cfg.docker.image.clone(),
            repo_mount: cfg.docker.repo_mount.clone(),
            cache_dir: PathBuf::from(expand_path(&cfg.docker.cache_dir)),
            cache_mount: cfg.docker.cache_mount.clone(),
            stop_grace_sec: cfg.docker.stop_grace_sec,
            venv_activate: cfg.launch.venv_activate.clone(),
            driver_script: cfg.launch.driver_script.clone(),
        }
    }
}

/// Numeric identity the container runs as, so files it writes into the
/// mounted repository stay owned by the invoking user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl HostIdentity {
    pub fn current() -> Result<Self, SolverError> {
        Ok(Self {
            uid: id_value("-u")?,
            gid: id_value("-g")?,
        })
    }

    pub fn user_arg(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

fn id_value(flag: &str) -> Result<u32, SolverError> {
    let output = Command::new("id")
        .arg(flag)
        .output()
        .map_err(|err| SolverError::Process(format!("failed to run `id {flag}`: {err}")))?;
    if output.status.success() {
        let text = String::from_utf8_lossy(&output.stdout);
        if let Ok(value) = text.trim().parse::<u32>() {
            return Ok(value);
        }
    }
    Err(SolverError::Process(format!(
        "could not determine host identity from `id {flag}`"
    )))
}

/// Escapes a value for use inside a single-quoted shell word: every `'`
/// closes the quote, emits a double-quoted `'`, and reopens.
pub fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', "'\"'\"'")
}

fn reject_nul(field: &str, value: &str) -> Result<(), SolverError> {
    if value.contains('\0') {
        return Err(SolverError::Config(format!("{field} must not contain a NUL byte")));
    }
    Ok(())
}

fn quote_token(field: &str, value: &str) -> Result<String, SolverError> {
    reject_nul(field, value)?;
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|err| SolverError::Config(format!("cannot quote {field}: {err}")))
}

/// Builds `[/bin/bash, -c, <script>]` for the driver inside the container.
pub fn build_entrypoint(
    settings: &LaunchSettings,
    request: &LaunchRequest,
) -> Result<Vec<String>, SolverError> {
    reject_nul("background", &request.background)?;
    let model = quote_token("model name", &request.model_name)?;
    let mut script = format!(
        "source {} && python {} --model-name {} --instance-background '{}'",
        settings.venv_activate,
        settings.driver_script,
        model,
        escape_single_quoted(&request.background)
    );
    if let Some(test_command) = request.test_command.as_deref().filter(|cmd| !cmd.is_empty()) {
        script.push_str(" --test-command ");
        script.push_str(&quote_token("test command", test_command)?);
    }
    Ok(vec![SHELL.to_string(), "-c".to_string(), script])
}

/// Arguments for `docker run`. Environment variables are passed by name only;
/// the docker client reads their values from its own environment, which is
/// the snapshot.
pub fn docker_run_args(
    settings: &LaunchSettings,
    identity: &HostIdentity,
    repo_dir: &Path,
    env: &EnvSnapshot,
    entrypoint: &[String],
    name: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--tty".to_string(),
        "--interactive".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--user".to_string(),
        identity.user_arg(),
        "--volume".to_string(),
        format!("{}:{}:rw", repo_dir.display(), settings.repo_mount),
        "--volume".to_string(),
        format!("{}:{}:rw", settings.cache_dir.display(), settings.cache_mount),
    ];
    for key in env.names() {
        args.push("--env".to_string());
        args.push(key.to_string());
    }
    if let Some((program, rest)) = entrypoint.split_first() {
        args.push("--entrypoint".to_string());
        args.push(program.clone());
        args.push(settings.image.clone());
        args.extend(rest.iter().cloned());
    } else {
        args.push(settings.image.clone());
    }
    args
}

fn container_name() -> String {
    format!(
        "aider-solver-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        std::process::id()
    )
}

/// Canonicalizes the repository path and checks it is a readable directory.
pub fn validate_repo_dir(path: &Path) -> Result<PathBuf, SolverError> {
    let canonical = path.canonicalize().map_err(|err| {
        SolverError::Config(format!(
            "repository path {} is not accessible: {}",
            path.display(),
            err
        ))
    })?;
    if !canonical.is_dir() {
        return Err(SolverError::Config(format!(
            "repository path {} is not a directory",
            canonical.display()
        )));
    }
    fs::read_dir(&canonical).map_err(|err| {
        SolverError::Config(format!(
            "repository path {} is not readable: {}",
            canonical.display(),
            err
        ))
    })?;
    Ok(canonical)
}

/// Exclusive hold on the shared host cache directory.
///
/// Backed by an advisory lock on `<cache>.lock`; the kernel drops it when
/// the file handle closes, including when the process is killed. The lock
/// file itself is left on disk.
#[derive(Debug)]
pub struct CacheLock {
    _file: fs::File,
}

impl CacheLock {
    pub fn acquire(cache_dir: &Path) -> Result<Self, SolverError> {
        fs::create_dir_all(cache_dir)?;
        let path = PathBuf::from(format!("{}.lock", cache_dir.display()));
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                Err(SolverError::Config(format!(
                    "cache directory {} is in use by another launch (lock file {})",
                    cache_dir.display(),
                    path.display()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }
}

struct ContainerGuard<'a, R: DockerRunner> {
    runner: &'a R,
    id: String,
    stop_grace_sec: u64,
    stopped: bool,
    released: bool,
}

impl<'a, R: DockerRunner> ContainerGuard<'a, R> {
    fn new(runner: &'a R, id: String, stop_grace_sec: u64) -> Self {
        Self {
            runner,
            id,
            stop_grace_sec,
            stopped: false,
            released: false,
        }
    }

    fn docker(&self, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput, SolverError> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        execute_docker(self.runner, &args, &BTreeMap::new(), timeout)
    }

    fn command_deadline(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.stop_grace_sec) + DOCKER_COMMAND_MARGIN)
    }

    /// Blocks until the container exits; returns its exit code (-1 if docker
    /// reports something unparseable).
    fn wait(&self, timeout: Duration) -> Result<i64, SolverError> {
        let output = self.docker(&["wait", &self.id], Some(timeout))?;
        Ok(output
            .stdout_text()
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .unwrap_or(-1))
    }

    fn stop(&mut self) -> Result<(), SolverError> {
        let grace = self.stop_grace_sec.to_string();
        self.docker(&["stop", "--time", &grace, &self.id], self.command_deadline())?;
        self.stopped = true;
        Ok(())
    }

    fn logs(&self) -> Result<String, SolverError> {
        let output = self.docker(&["logs", &self.id], self.command_deadline())?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    fn remove(&mut self) -> Result<(), SolverError> {
        self.docker(&["rm", "--force", &self.id], self.command_deadline())?;
        self.released = true;
        Ok(())
    }

    fn stop_and_remove(&mut self) -> Result<(), SolverError> {
        if !self.stopped {
            self.stop()?;
        }
        self.remove()
    }

    /// Error-path cleanup: dump raw logs, then stop and remove. A failed
    /// cleanup gets exactly one more stop+remove attempt; nothing raised here
    /// reaches the caller.
    fn salvage(&mut self) {
        match self.logs() {
            Ok(raw) => tracing::info!(container = %self.id, logs = %raw, "Container logs"),
            Err(err) => {
                tracing::warn!(container = %self.id, error = %err, "Failed to fetch container logs")
            }
        }
        if let Err(err) = self.stop_and_remove() {
            tracing::warn!(container = %self.id, error = %err, "Container cleanup failed; retrying once");
            if !self.stopped {
                if let Err(err) = self.stop() {
                    tracing::warn!(container = %self.id, error = %err, "Fallback stop failed");
                }
            }
            if let Err(err) = self.remove() {
                tracing::error!(
                    container = %self.id,
                    error = %err,
                    "Fallback remove failed; container may need manual removal"
                );
            }
        }
        self.released = true;
    }
}

impl<R: DockerRunner> Drop for ContainerGuard<'_, R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let args = vec!["rm".to_string(), "--force".to_string(), self.id.clone()];
        let result = execute_docker(self.runner, &args, &BTreeMap::new(), self.command_deadline());
        if let Err(err) = result {
            tracing::warn!(container = %self.id, error = %err, "Failed to remove container on drop");
        }
    }
}

/// Runs the coding assistant image against a repository and returns the
/// summarized output.
pub struct Launcher<R, S> {
    settings: LaunchSettings,
    identity: HostIdentity,
    env: EnvSnapshot,
    runner: R,
    sanitizer: LogSanitizer<S>,
}

impl<R: DockerRunner, S: Summarizer> Launcher<R, S> {
    pub fn new(
        settings: LaunchSettings,
        identity: HostIdentity,
        env: EnvSnapshot,
        runner: R,
        sanitizer: LogSanitizer<S>,
    ) -> Self {
        Self {
            settings,
            identity,
            env,
            runner,
            sanitizer,
        }
    }

    #[cfg(test)]
    fn runner(&self) -> &R {
        &self.runner
    }

    pub fn launch(&self, request: &LaunchRequest) -> Result<String, SolverError> {
        if request.timeout.is_zero() {
            return Err(SolverError::Config(
                "timeout must be greater than 0 seconds".to_string(),
            ));
        }
        let repo_dir = validate_repo_dir(&request.repo_dir)?;
        let entrypoint = build_entrypoint(&self.settings, request)?;
        let _cache_lock = CacheLock::acquire(&self.settings.cache_dir)?;

        let name = container_name();
        let args = docker_run_args(
            &self.settings,
            &self.identity,
            &repo_dir,
            &self.env,
            &entrypoint,
            &name,
        );
        tracing::info!(image = %self.settings.image, entrypoint = ?entrypoint, "Launching container");
        let output = match execute_docker(&self.runner, &args, self.env.as_map(), None) {
            Ok(output) => output,
            Err(err) => {
                // A failed `docker run` can still leave a created container behind.
                let rm = vec!["rm".to_string(), "--force".to_string(), name.clone()];
                let rm_result =
                    execute_docker(&self.runner, &rm, &BTreeMap::new(), Some(DOCKER_COMMAND_MARGIN));
                if let Err(rm_err) = rm_result {
                    tracing::debug!(container = %name, error = %rm_err, "No container to clean up after failed run");
                }
                return Err(err);
            }
        };
        let id = output
            .stdout_text()
            .lines()
            .last()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map_or_else(|| name.clone(), str::to_string);

        let mut container = ContainerGuard::new(&self.runner, id, self.settings.stop_grace_sec);
        tracing::info!(container = %container.id, name = %name, "Container launched");

        match self.run_to_completion(&mut container, request.timeout) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                tracing::error!(container = %container.id, error = %err, "Container execution failed");
                container.salvage();
                Err(err)
            }
        }
    }

    fn run_to_completion(
        &self,
        container: &mut ContainerGuard<'_, R>,
        timeout: Duration,
    ) -> Result<String, SolverError> {
        let exit_code = container.wait(timeout)?;
        if let Err(err) = container.stop() {
            tracing::warn!(container = %container.id, error = %err, "Failed to stop exited container");
        }

        let raw = container.logs()?;
        tracing::debug!(container = %container.id, logs = %raw, "Raw container logs");
        let summary = self.sanitizer.sanitize(&raw);
        tracing::info!(container = %container.id, logs = %summary, "Logs");
        tracing::info!(container = %container.id, exit_code, "Container finished");

        match container.remove() {
            Ok(()) => tracing::info!(container = %container.id, "Container removed"),
            Err(err) => {
                tracing::warn!(container = %container.id, error = %err, "Failed to remove container")
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::MockDockerRunner;
    use crate::summarize::{DisabledSummarizer, SummarizeError};
    use std::io;
    use tempfile::{tempdir, TempDir};

    const SCENARIO_LOG: &str = "\x1b[32mBuilding...\x1b[0m\nDone.\nTokens: 123";

    struct CannedSummarizer(&'static str);

    impl Summarizer for CannedSummarizer {
        fn summarize(&self, _system: &str, _user: &str) -> Result<String, SummarizeError> {
            Ok(self.0.to_string())
        }
    }

    fn settings(cache_root: &Path) -> LaunchSettings {
        let mut settings = LaunchSettings::from_config(&Config::default());
        settings.cache_dir = cache_root.join("aider_cache");
        settings
    }

    fn request(repo_dir: &Path) -> LaunchRequest {
        LaunchRequest {
            repo_dir: repo_dir.to_path_buf(),
            model_name: "gpt-4o".to_string(),
            background: "Fix the failing parser test".to_string(),
            test_command: Some("pytest -q".to_string()),
            timeout: Duration::from_secs(30),
        }
    }

    fn identity() -> HostIdentity {
        HostIdentity {
            uid: 1000,
            gid: 1000,
        }
    }

    fn snapshot() -> EnvSnapshot {
        [("OPENAI_API_KEY", "sk-secret"), ("HOME", "/home/dev")]
            .into_iter()
            .collect()
    }

    struct Fixture {
        dir: TempDir,
        launcher: Launcher<MockDockerRunner, DisabledSummarizer>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("repo")).unwrap();
        let launcher = Launcher::new(
            settings(dir.path()),
            identity(),
            snapshot(),
            MockDockerRunner::default(),
            LogSanitizer::new(DisabledSummarizer, "Tokens:"),
        );
        Fixture { dir, launcher }
    }

    impl Fixture {
        fn request(&self) -> LaunchRequest {
            request(&self.dir.path().join("repo"))
        }

        fn runner(&self) -> &MockDockerRunner {
            self.launcher.runner()
        }
    }

    fn script_of(entrypoint: &[String]) -> Vec<String> {
        assert_eq!(entrypoint[0], "/bin/bash");
        assert_eq!(entrypoint[1], "-c");
        shlex::split(&entrypoint[2]).expect("entrypoint script parses as shell words")
    }

    fn flag_value(tokens: &[String], flag: &str) -> Option<String> {
        let idx = tokens.iter().position(|token| token == flag)?;
        tokens.get(idx + 1).cloned()
    }

    #[test]
    fn escape_single_quoted_reenters_quoting() {
        assert_eq!(escape_single_quoted("it's"), "it'\"'\"'s");
    }

    #[test]
    fn hostile_background_survives_as_one_argument() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        for background in [
            "it's broken",
            "'; rm -rf / #",
            "$(whoami) `id` \"double\" \\back",
            "line one\nline 'two'\n",
            "''''",
        ] {
            let mut req = request(dir.path());
            req.background = background.to_string();
            let tokens = script_of(&build_entrypoint(&settings, &req).unwrap());
            assert_eq!(
                flag_value(&tokens, "--instance-background").as_deref(),
                Some(background),
                "background {background:?}"
            );
            assert_eq!(tokens[..2], ["source", "/venv/bin/activate"]);
            assert_eq!(tokens[2], "&&");
        }
    }

    #[test]
    fn model_and_test_command_are_shell_quoted() {
        let dir = tempdir().unwrap();
        let mut req = request(dir.path());
        req.model_name = "gpt-4o; echo pwned".to_string();
        req.test_command = Some("pytest -k 'parser and not slow'".to_string());
        let tokens = script_of(&build_entrypoint(&settings(dir.path()), &req).unwrap());
        assert_eq!(
            flag_value(&tokens, "--model-name").as_deref(),
            Some("gpt-4o; echo pwned")
        );
        assert_eq!(
            flag_value(&tokens, "--test-command").as_deref(),
            Some("pytest -k 'parser and not slow'")
        );
        assert!(!tokens.iter().any(|token| token == "echo"));
    }

    #[test]
    fn test_flag_appears_only_for_non_empty_command() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        for absent in [None, Some(String::new())] {
            let mut req = request(dir.path());
            req.test_command = absent;
            let entrypoint = build_entrypoint(&settings, &req).unwrap();
            assert!(!entrypoint[2].contains("--test-command"));
        }
        let req = request(dir.path());
        let tokens = script_of(&build_entrypoint(&settings, &req).unwrap());
        assert_eq!(
            tokens.iter().filter(|token| *token == "--test-command").count(),
            1
        );
        assert_eq!(flag_value(&tokens, "--test-command").as_deref(), Some("pytest -q"));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let dir = tempdir().unwrap();
        let mut req = request(dir.path());
        req.background = "bad\0value".to_string();
        let err = build_entrypoint(&settings(dir.path()), &req).expect_err("nul");
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn run_args_bind_mounts_identity_and_env_names() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let repo = dir.path().join("repo");
        let entrypoint = build_entrypoint(&settings, &request(&repo)).unwrap();
        let args = docker_run_args(&settings, &identity(), &repo, &snapshot(), &entrypoint, "c1");

        assert_eq!(args[..4], ["run", "--detach", "--tty", "--interactive"]);
        assert_eq!(flag_value(&args, "--user").as_deref(), Some("1000:1000"));
        assert!(args.contains(&format!("{}:/app:rw", repo.display())));
        assert!(args.contains(&format!(
            "{}:/home/ubuntu:rw",
            dir.path().join("aider_cache").display()
        )));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--env" && w[1] == "OPENAI_API_KEY"));
        assert!(args.windows(2).any(|w| w[0] == "--env" && w[1] == "HOME"));
        assert!(!args.iter().any(|arg| arg.contains("sk-secret")));

        let image_idx = args.iter().position(|arg| arg == "paulgauthier/aider").unwrap();
        assert_eq!(args[image_idx - 2..image_idx], ["--entrypoint", "/bin/bash"]);
        assert_eq!(args[image_idx + 1], "-c");
        assert_eq!(args[image_idx + 2], entrypoint[2]);
        assert_eq!(args.len(), image_idx + 3);
    }

    #[test]
    fn launch_success_runs_full_lifecycle() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_output("wait", 0, "0\n", "");
        fx.runner().push_output("logs", 0, SCENARIO_LOG, "");

        let summary = fx.launcher.launch(&fx.request()).expect("launch");
        assert_eq!(summary, "Building...\nDone.");
        assert_eq!(fx.runner().subcommands(), ["run", "wait", "stop", "logs", "rm"]);

        let calls = fx.runner().calls();
        assert_eq!(calls[0].env_overrides, *snapshot().as_map());
        assert_eq!(calls[1].args, ["wait", "abc123"]);
        assert_eq!(calls[1].timeout, Some(Duration::from_secs(30)));
        assert_eq!(calls[2].args, ["stop", "--time", "10", "abc123"]);
        assert_eq!(calls[4].args, ["rm", "--force", "abc123"]);
        assert!(calls[1..].iter().all(|call| call.env_overrides.is_empty()));
    }

    #[test]
    fn post_wait_docker_calls_are_bounded() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.launcher.launch(&fx.request()).expect("launch");

        let calls = fx.runner().calls();
        assert_eq!(calls[0].timeout, None);
        for call in &calls[2..] {
            assert_eq!(call.timeout, Some(Duration::from_secs(40)), "{:?}", call.args);
        }
    }

    #[test]
    fn hung_stop_during_cleanup_times_out_and_still_removes() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_error("wait", io::ErrorKind::TimedOut);
        fx.runner().push_error("stop", io::ErrorKind::TimedOut);

        let err = fx.launcher.launch(&fx.request()).expect_err("timeout");
        assert!(matches!(err, SolverError::Timeout { timeout_sec: 30, .. }), "{err:?}");
        assert_eq!(fx.runner().count("rm"), 1);
    }

    #[test]
    fn launch_returns_summarizer_text() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("repo")).unwrap();
        let launcher = Launcher::new(
            settings(dir.path()),
            identity(),
            snapshot(),
            MockDockerRunner::default(),
            LogSanitizer::new(CannedSummarizer(" Fixed the parser. "), "Tokens:"),
        );
        launcher.runner().push_output("run", 0, "abc123\n", "");
        launcher.runner().push_output("logs", 0, SCENARIO_LOG, "");
        let summary = launcher.launch(&request(&dir.path().join("repo"))).unwrap();
        assert_eq!(summary, "Fixed the parser.");
    }

    #[test]
    fn non_zero_exit_still_returns_summary() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_output("wait", 0, "1\n", "");
        fx.runner().push_output("logs", 0, "Tests failed\n", "");
        assert_eq!(fx.launcher.launch(&fx.request()).unwrap(), "Tests failed\n");
    }

    #[test]
    fn wait_timeout_cleans_up_once_and_propagates_timeout() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_error("wait", io::ErrorKind::TimedOut);

        let err = fx.launcher.launch(&fx.request()).expect_err("timeout");
        assert!(matches!(err, SolverError::Timeout { timeout_sec: 30, .. }), "{err:?}");
        assert_eq!(fx.runner().subcommands(), ["run", "wait", "logs", "stop", "rm"]);
        assert_eq!(fx.runner().count("stop"), 1);
        assert_eq!(fx.runner().count("rm"), 1);
    }

    #[test]
    fn failed_cleanup_is_retried_once_and_never_masks_original_error() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_error("wait", io::ErrorKind::TimedOut);
        fx.runner().push_output("logs", 1, "", "Error: No such container");
        fx.runner().push_output("stop", 1, "", "daemon hiccup");
        fx.runner().push_output("stop", 1, "", "daemon hiccup");
        fx.runner().push_output("rm", 1, "", "daemon hiccup");

        let err = fx.launcher.launch(&fx.request()).expect_err("timeout");
        assert!(matches!(err, SolverError::Timeout { .. }), "{err:?}");
        assert_eq!(
            fx.runner().subcommands(),
            ["run", "wait", "logs", "stop", "stop", "rm"]
        );
    }

    #[test]
    fn remove_failure_in_cleanup_is_retried_without_restopping() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_output("wait", 0, "0\n", "");
        fx.runner().push_output("stop", 0, "", "");
        fx.runner().push_error("logs", io::ErrorKind::BrokenPipe);
        fx.runner().push_output("rm", 1, "", "removal in progress");

        let err = fx.launcher.launch(&fx.request()).expect_err("logs failed");
        assert!(matches!(err, SolverError::ProcessDetailed { .. }), "{err:?}");
        assert_eq!(
            fx.runner().subcommands(),
            ["run", "wait", "stop", "logs", "logs", "rm", "rm"]
        );
    }

    #[test]
    fn remove_failure_on_success_path_keeps_summary() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_output("logs", 0, "Done.\n", "");
        fx.runner().push_output("rm", 1, "", "device busy");

        assert_eq!(fx.launcher.launch(&fx.request()).unwrap(), "Done.\n");
        // The guard retries removal when it goes out of scope.
        assert_eq!(fx.runner().count("rm"), 2);
    }

    #[test]
    fn failed_run_reports_error_and_clears_created_container() {
        let fx = fixture();
        fx.runner().push_output(
            "run",
            125,
            "",
            "Unable to find image 'paulgauthier/aider:latest' locally",
        );
        fx.runner().push_output("rm", 1, "", "Error: No such container");

        let err = fx.launcher.launch(&fx.request()).expect_err("run failed");
        assert_eq!(
            err.process_details().unwrap().error_code,
            "docker_image_not_found"
        );
        assert_eq!(fx.runner().subcommands(), ["run", "rm"]);
        assert!(fx.runner().calls()[1].args[2].starts_with("aider-solver-"));
    }

    #[test]
    fn missing_repo_fails_before_docker() {
        let fx = fixture();
        let mut req = fx.request();
        req.repo_dir = fx.dir.path().join("missing");
        let err = fx.launcher.launch(&req).expect_err("missing repo");
        assert!(err.to_string().contains("is not accessible"));
        assert!(fx.runner().calls().is_empty());
    }

    #[test]
    fn repo_must_be_a_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = validate_repo_dir(&file).expect_err("file is not a repo");
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let fx = fixture();
        let mut req = fx.request();
        req.timeout = Duration::ZERO;
        assert!(matches!(
            fx.launcher.launch(&req),
            Err(SolverError::Config(_))
        ));
        assert!(fx.runner().calls().is_empty());
    }

    #[test]
    fn cache_lock_is_exclusive_and_released() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("aider_cache");
        let lock = CacheLock::acquire(&cache).expect("first lock");
        assert!(cache.is_dir());
        let err = CacheLock::acquire(&cache).expect_err("second lock");
        assert!(err.to_string().contains("in use by another launch"));
        drop(lock);
        CacheLock::acquire(&cache).expect("lock after release");
    }

    #[test]
    fn launch_releases_cache_lock() {
        let fx = fixture();
        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.launcher.launch(&fx.request()).unwrap();
        CacheLock::acquire(&fx.dir.path().join("aider_cache")).expect("lock after launch");
    }

    #[test]
    fn leftover_lock_file_does_not_block_launch() {
        let fx = fixture();
        let cache = fx.dir.path().join("aider_cache");
        fs::create_dir_all(&cache).unwrap();
        fs::write(format!("{}.lock", cache.display()), "12345\n").unwrap();

        fx.runner().push_output("run", 0, "abc123\n", "");
        fx.runner().push_output("logs", 0, SCENARIO_LOG, "");
        let summary = fx.launcher.launch(&fx.request()).expect("first launch");
        assert_eq!(summary, "Building...\nDone.");

        fx.runner().push_output("run", 0, "def456\n", "");
        fx.launcher.launch(&fx.request()).expect("second launch");
        assert_eq!(fx.runner().count("run"), 2);
    }

    #[test]
    fn held_lock_blocks_launch_before_docker() {
        let fx = fixture();
        let _held = CacheLock::acquire(&fx.dir.path().join("aider_cache")).unwrap();
        let err = fx.launcher.launch(&fx.request()).expect_err("lock held");
        assert!(err.to_string().contains("in use by another launch"), "{err}");
        assert!(fx.runner().calls().is_empty());
    }
}
