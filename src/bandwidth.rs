use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{watch, Semaphore};
use tokio::time;
use tracing::{info, warn};

#[cfg(windows)]
pub const DEFAULT_SPEEDTEST_EXECUTABLE: &str = "speedtest.exe";
#[cfg(not(windows))]
pub const DEFAULT_SPEEDTEST_EXECUTABLE: &str = "speedtest";
pub const DEFAULT_SPEEDTEST_TIMEOUT_SECS: u64 = 60;
pub const SPEEDTEST_ARGS: [&str; 3] = ["--format=json", "--accept-license", "--accept-gdpr"];

const BYTES_PER_SEC_PER_MBIT: f64 = 125_000.0;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandwidthResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub measured_at_unix: i64,
}

#[derive(Debug, Error)]
pub enum BandwidthError {
    #[error("cannot locate speedtest directory: {0}")]
    Locate(#[source] std::io::Error),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for speedtest: {0}")]
    Wait(#[source] std::io::Error),
    #[error("speedtest did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("speedtest exited with code {code:?}; stderr: {stderr}; stdout: {stdout}")]
    Exit {
        code: Option<i32>,
        stderr: String,
        stdout: String,
    },
    #[error("speedtest produced no output")]
    EmptyOutput,
    #[error("speedtest output is not a result document ({reason}): {raw}")]
    Malformed { reason: String, raw: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<ProcessOutput, BandwidthError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<ProcessOutput, BandwidthError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(|source| BandwidthError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        match time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(err)) => Err(BandwidthError::Wait(err)),
            Err(_elapsed) => Err(BandwidthError::TimedOut(timeout)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Measured,
    Busy,
    MissingExecutable,
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Measured => "measured",
            Self::Busy => "busy",
            Self::MissingExecutable => "missing_executable",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub outcome: RunOutcome,
    pub result: BandwidthResult,
}

/// Only one run is in flight at a time. A request that arrives while a run
/// is active gets the last good result back immediately.
pub struct BandwidthTester {
    runner: Arc<dyn CommandRunner>,
    executable: String,
    executable_dir: Option<PathBuf>,
    timeout: Duration,
    gate: Semaphore,
    last_good: watch::Sender<BandwidthResult>,
}

impl BandwidthTester {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        executable: impl Into<String>,
        executable_dir: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        let (last_good, _) = watch::channel(BandwidthResult::default());
        Self {
            runner,
            executable: executable.into(),
            executable_dir,
            timeout,
            gate: Semaphore::new(1),
            last_good,
        }
    }

    pub fn last_good(&self) -> BandwidthResult {
        self.last_good.borrow().clone()
    }

    pub fn executable_path(&self) -> Result<PathBuf, BandwidthError> {
        let dir = match &self.executable_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_exe()
                .map_err(BandwidthError::Locate)?
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        Ok(dir.join(&self.executable))
    }

    pub async fn run(&self) -> BandwidthResult {
        self.measure().await.result
    }

    pub async fn measure(&self) -> Measurement {
        let Ok(_permit) = self.gate.try_acquire() else {
            info!("speedtest already running, returning last result");
            return Measurement {
                outcome: RunOutcome::Busy,
                result: self.last_good(),
            };
        };

        let path = match self.executable_path() {
            Ok(path) if path.is_file() => path,
            Ok(path) => {
                warn!(path = %path.display(), "speedtest executable not found");
                return failed(RunOutcome::MissingExecutable);
            }
            Err(err) => {
                warn!(error = %err, "speedtest executable not found");
                return failed(RunOutcome::MissingExecutable);
            }
        };

        match self.execute(&path).await {
            Ok(result) => {
                info!(
                    download_mbps = result.download_mbps,
                    upload_mbps = result.upload_mbps,
                    latency_ms = result.latency_ms,
                    "speedtest finished"
                );
                self.last_good.send_replace(result.clone());
                Measurement {
                    outcome: RunOutcome::Measured,
                    result,
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "speedtest failed");
                failed(RunOutcome::Failed)
            }
        }
    }

    async fn execute(&self, path: &Path) -> Result<BandwidthResult, BandwidthError> {
        let output = self.runner.run(path, &SPEEDTEST_ARGS, self.timeout).await?;
        if !output.success {
            return Err(BandwidthError::Exit {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
                stdout: output.stdout.trim().to_string(),
            });
        }
        let mut result = parse_speedtest_output(&output.stdout)?;
        result.measured_at_unix = unix_now();
        Ok(result)
    }
}

fn failed(outcome: RunOutcome) -> Measurement {
    Measurement {
        outcome,
        result: BandwidthResult::default(),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn parse_speedtest_output(raw: &str) -> Result<BandwidthResult, BandwidthError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BandwidthError::EmptyOutput);
    }

    let doc: Value = serde_json::from_str(trimmed).map_err(|err| BandwidthError::Malformed {
        reason: err.to_string(),
        raw: trimmed.to_string(),
    })?;
    if !doc.is_object() {
        return Err(BandwidthError::Malformed {
            reason: "top-level value is not an object".to_string(),
            raw: trimmed.to_string(),
        });
    }

    let number = |section: &str, key: &str| {
        doc.get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_f64().or_else(|| v.as_str()?.trim().parse().ok()))
            .unwrap_or(0.0)
    };

    Ok(BandwidthResult {
        download_mbps: number("download", "bandwidth") / BYTES_PER_SEC_PER_MBIT,
        upload_mbps: number("upload", "bandwidth") / BYTES_PER_SEC_PER_MBIT,
        latency_ms: number("ping", "latency"),
        jitter_ms: number("ping", "jitter"),
        measured_at_unix: 0,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    pub(crate) const SAMPLE: &str = r#"{"type":"result","timestamp":"2024-05-01T10:00:00Z","ping":{"jitter":1.1,"latency":15.2,"low":14.0,"high":18.3},"download":{"bandwidth":12500000,"bytes":150000000,"elapsed":12000},"upload":{"bandwidth":6250000,"bytes":70000000,"elapsed":11000},"isp":"Example ISP","result":{"id":"abc"}}"#;

    pub(crate) struct ScriptedRunner {
        pub response: Mutex<Option<Result<ProcessOutput, BandwidthError>>>,
        pub calls: AtomicUsize,
        pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(response: Result<ProcessOutput, BandwidthError>) -> Self {
            Self {
                response: Mutex::new(Some(response)),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }
    }

    pub(crate) fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            success: code == 0,
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _program: &Path,
            args: &[&str],
            _timeout: Duration,
        ) -> Result<ProcessOutput, BandwidthError> {
            assert_eq!(args, SPEEDTEST_ARGS);
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((started, release)) = &self.gate {
                started.notify_one();
                release.notified().await;
            }
            self.response
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(BandwidthError::EmptyOutput))
        }
    }

    pub(crate) fn install_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_SPEEDTEST_EXECUTABLE), b"").unwrap();
        dir
    }

    pub(crate) fn tester(runner: Arc<dyn CommandRunner>, dir: &Path) -> BandwidthTester {
        BandwidthTester::new(
            runner,
            DEFAULT_SPEEDTEST_EXECUTABLE,
            Some(dir.to_path_buf()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn parses_sample_result() {
        let result = parse_speedtest_output(SAMPLE).unwrap();
        assert_eq!(result.download_mbps, 100.0);
        assert_eq!(result.upload_mbps, 50.0);
        assert_eq!(result.latency_ms, 15.2);
        assert_eq!(result.jitter_ms, 1.1);
    }

    #[test]
    fn missing_fields_read_as_zero() {
        let result =
            parse_speedtest_output(r#"{"download":{"bandwidth":25000000},"ping":{}}"#).unwrap();
        assert_eq!(result.download_mbps, 200.0);
        assert_eq!(result.upload_mbps, 0.0);
        assert_eq!(result.latency_ms, 0.0);
        assert_eq!(result.jitter_ms, 0.0);

        let stringly =
            parse_speedtest_output(r#"{"upload":{"bandwidth":"1250000"},"ping":{"latency":null}}"#)
                .unwrap();
        assert_eq!(stringly.upload_mbps, 10.0);
        assert_eq!(stringly.latency_ms, 0.0);
    }

    #[test]
    fn missing_upload_keeps_download_and_ping() {
        let result = parse_speedtest_output(
            r#"{"download":{"bandwidth":12500000},"ping":{"latency":15.2,"jitter":1.1}}"#,
        )
        .unwrap();
        assert_eq!(
            result,
            BandwidthResult {
                download_mbps: 100.0,
                upload_mbps: 0.0,
                latency_ms: 15.2,
                jitter_ms: 1.1,
                measured_at_unix: 0,
            }
        );
    }

    #[test]
    fn rejects_empty_and_malformed_output() {
        assert!(matches!(
            parse_speedtest_output("  \n"),
            Err(BandwidthError::EmptyOutput)
        ));
        assert!(matches!(
            parse_speedtest_output("{\"download\":"),
            Err(BandwidthError::Malformed { .. })
        ));
        assert!(matches!(
            parse_speedtest_output("[1, 2, 3]"),
            Err(BandwidthError::Malformed { .. })
        ));
        assert!(matches!(
            parse_speedtest_output("Speedtest by Ookla"),
            Err(BandwidthError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn successful_run_is_cached() {
        let dir = install_dir();
        let t = tester(
            Arc::new(ScriptedRunner::new(Ok(exited(0, SAMPLE, "")))),
            dir.path(),
        );
        let measurement = t.measure().await;
        assert_eq!(measurement.outcome, RunOutcome::Measured);
        assert_eq!(measurement.result.download_mbps, 100.0);
        assert!(measurement.result.measured_at_unix > 0);
        assert_eq!(t.last_good(), measurement.result);
    }

    #[tokio::test]
    async fn failures_return_zero_and_keep_cache() {
        let dir = install_dir();
        let runner = Arc::new(ScriptedRunner::new(Ok(exited(0, SAMPLE, ""))));
        let t = tester(runner.clone(), dir.path());
        let good = t.run().await;

        for response in [
            Ok(exited(2, "", "No servers available")),
            Ok(exited(0, "not json", "")),
            Ok(exited(0, "", "")),
            Err(BandwidthError::TimedOut(Duration::from_secs(60))),
        ] {
            *runner.response.lock().unwrap() = Some(response);
            let measurement = t.measure().await;
            assert_eq!(measurement.outcome, RunOutcome::Failed);
            assert_eq!(measurement.result, BandwidthResult::default());
            assert_eq!(t.last_good(), good);
        }
    }

    #[tokio::test]
    async fn missing_executable_yields_zero_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(Ok(exited(0, SAMPLE, ""))));
        let t = tester(runner.clone(), dir.path());

        let measurement = t.measure().await;
        assert_eq!(measurement.outcome, RunOutcome::MissingExecutable);
        assert_eq!(measurement.result, BandwidthResult::default());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            t.executable_path().unwrap(),
            dir.path().join(DEFAULT_SPEEDTEST_EXECUTABLE)
        );
    }

    #[tokio::test]
    async fn concurrent_request_gets_cached_result() {
        let dir = install_dir();
        let first = Arc::new(ScriptedRunner::new(Ok(exited(0, SAMPLE, ""))));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let runner = Arc::new(ScriptedRunner {
            gate: Some((started.clone(), release.clone())),
            ..ScriptedRunner::new(Ok(exited(
                0,
                r#"{"download":{"bandwidth":1250000},"upload":{"bandwidth":1250000}}"#,
                "",
            )))
        });

        // Seed the cache through a separate tester sharing nothing but the result.
        let seeded = tester(first, dir.path()).run().await;
        let t = Arc::new(tester(runner.clone(), dir.path()));
        t.last_good.send_replace(seeded.clone());

        let in_flight = tokio::spawn({
            let t = t.clone();
            async move { t.measure().await }
        });
        started.notified().await;

        let busy = t.measure().await;
        assert_eq!(busy.outcome, RunOutcome::Busy);
        assert_eq!(busy.result, seeded);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        release.notify_one();
        let done = in_flight.await.unwrap();
        assert_eq!(done.outcome, RunOutcome::Measured);
        assert_eq!(done.result.download_mbps, 10.0);
        assert_eq!(t.last_good(), done.result);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_runner_kills_process_at_deadline() {
        let started = std::time::Instant::now();
        let err = TokioCommandRunner
            .run(Path::new("sleep"), &["5"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BandwidthError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_runner_captures_both_streams() {
        let output = TokioCommandRunner
            .run(
                Path::new("sh"),
                &["-c", "echo out; echo err >&2; exit 3"],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn tokio_runner_reports_spawn_failure() {
        let err = TokioCommandRunner
            .run(
                Path::new("/definitely/not/a/speedtest"),
                &[],
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BandwidthError::Spawn { .. }));
    }
}
