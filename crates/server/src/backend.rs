use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use cadgate_core::{BuildRequest, BuildTarget};
use cadgate_engine::{BuildError, CancelToken, Worker};

/// The opaque worker contract: turns a canonical build request into the
/// function the cache will run on a dedicated thread.
pub trait BuildBackend: Send + Sync {
    /// Build function for `request`. Invoked at most once.
    fn worker(&self, request: &BuildRequest) -> Worker<serde_json::Value>;
}

/// One line of the build driver's stdout protocol.
///
/// Progress lines look like `{"progress":{"message":"…","percent":42}}`;
/// the final `{"result":…}` line carries the build output. Anything else is
/// ignored.
#[derive(Debug, Deserialize)]
struct DriverLine {
    #[serde(default)]
    progress: Option<DriverProgress>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DriverProgress {
    message: String,
    percent: u8,
}

/// Runs the external CAD build driver.
///
/// The driver is invoked as `<program> [args…] <operation> [assembly]
/// <params-json>` and must speak the [`DriverLine`] protocol on stdout. The
/// worker polls its cancel token between output lines and kills the child
/// once it is set, so cancellation latency is bounded by the poll interval
/// rather than the build duration.
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandBackend {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl BuildBackend for CommandBackend {
    fn worker(&self, request: &BuildRequest) -> Worker<serde_json::Value> {
        let program = self.program.clone();
        let mut args = self.args.clone();
        args.push(request.target.operation().to_string());
        if let Some(assembly) = request.target.assembly() {
            args.push(assembly.as_str().to_string());
        }
        args.push(request.params.canonical_json().to_string());
        let poll_interval = self.poll_interval;

        Box::new(move |report, cancel| {
            run_driver(&program, &args, poll_interval, report, cancel)
        })
    }
}

fn run_driver(
    program: &Path,
    args: &[String],
    poll_interval: Duration,
    report: &dyn Fn(&str, u8),
    cancel: &CancelToken,
) -> Result<serde_json::Value, BuildError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            BuildError::Failed(format!("failed to spawn {}: {err}", program.display()))
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BuildError::Failed("build driver stdout unavailable".to_string()))?;
    let stderr = child.stderr.take();

    // Reader thread feeds a channel so the control loop below can keep
    // polling the cancel token while stdout is quiet.
    let (line_tx, line_rx) = mpsc::channel::<std::io::Result<String>>();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let stderr_capture = stderr.map(|stderr| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf);
            buf
        })
    });

    let mut result = None;
    loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BuildError::Cancelled);
        }
        match line_rx.recv_timeout(poll_interval) {
            Ok(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<DriverLine>(line) {
                    Ok(message) => {
                        if let Some(progress) = message.progress {
                            report(&progress.message, progress.percent);
                        }
                        if let Some(value) = message.result {
                            result = Some(value);
                        }
                    }
                    Err(_) => debug!(line, "ignoring unrecognized build driver output"),
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // Read error or EOF: fall through to the exit status.
            Ok(Err(_)) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child
        .wait()
        .map_err(|err| BuildError::Failed(format!("failed to wait for build driver: {err}")))?;
    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled);
    }

    let stderr_tail = stderr_capture
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if !status.success() {
        let mut message = format!("build driver exited with {status}");
        let tail = stderr_tail.trim();
        if !tail.is_empty() {
            let mut start = tail.len().saturating_sub(400);
            while !tail.is_char_boundary(start) {
                start += 1;
            }
            message.push_str(": ");
            message.push_str(&tail[start..]);
        }
        return Err(BuildError::Failed(message));
    }

    result.ok_or_else(|| BuildError::Failed("build driver produced no result".to_string()))
}

/// Deterministic in-process stand-in for the CAD driver (`--demo`).
///
/// Walks four phases with short naps so cancellation stays responsive, then
/// returns a small per-operation document. Useful without a CAD
/// installation, and what the end-to-end tests run against.
pub struct DemoBackend {
    step: Duration,
}

impl DemoBackend {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }
}

impl Default for DemoBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(400))
    }
}

impl BuildBackend for DemoBackend {
    fn worker(&self, request: &BuildRequest) -> Worker<serde_json::Value> {
        let step = self.step;
        let target = request.target;
        let fingerprint = request.fingerprint();

        Box::new(move |report, cancel| {
            let phases = [
                ("Loading parameters", 10u8),
                ("Rebuilding model", 45),
                ("Exporting artifacts", 80),
                ("Finishing", 100),
            ];
            for (message, percent) in phases {
                for _ in 0..4 {
                    if cancel.is_cancelled() {
                        return Err(BuildError::Cancelled);
                    }
                    std::thread::sleep(step / 4);
                }
                report(message, percent);
            }

            Ok(match target {
                BuildTarget::Visualize(assembly) => serde_json::json!({
                    "obj": format!("demo/{}.obj", assembly.as_str()),
                    "fingerprint": fingerprint.as_str(),
                }),
                BuildTarget::CncOverview => serde_json::json!({
                    "svg": "<svg xmlns=\"http://www.w3.org/2000/svg\"/>",
                    "fingerprint": fingerprint.as_str(),
                }),
                BuildTarget::DimensionTables => serde_json::json!({
                    "tables": [],
                    "fingerprint": fingerprint.as_str(),
                }),
            })
        })
    }
}
