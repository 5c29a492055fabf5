//! Fetcher transports.
//!
//! A transport turns `(window, keyword, geo?)` into the raw bytes a fetch
//! script prints on stdout. The three realizations differ only in how the
//! command line is built; one shared helper spawns the subprocess, feeds
//! optional stdin, collects output and enforces the wall-clock ceiling.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::error;

use trendmill_core::payload::ErrorEnvelope;

/// Hard wall-clock ceiling for one fetch invocation.
const FETCH_CEILING: Duration = Duration::from_secs(60);

/// Exit code by which fetch scripts signal a structured upstream error.
const UPSTREAM_ERROR_EXIT: i32 = 5;

/// Failure modes of one fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The script relayed a structured error from the trend service.
    #[error("upstream error {code}: {msg}")]
    Response {
        /// Upstream status code.
        code: i64,
        /// Upstream message.
        msg: String,
    },
    /// Timeout, spawn failure or an unexplained nonzero exit.
    #[error("{0}")]
    Fatal(String),
}

/// How a transport reaches its fetch script.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportKind {
    /// Run the script in-process as a plain subprocess.
    Popen {
        /// Path to the fetch script.
        script: PathBuf,
    },
    /// Run the script under another identity via sudo.
    Sudo {
        /// Target user.
        user: String,
        /// Target group.
        group: String,
        /// Path to the fetch script.
        script: PathBuf,
    },
    /// Delegate to a launcher on a remote host over ssh, passing the
    /// request as three newline-delimited stdin lines.
    Ssh {
        /// Remote user.
        user: String,
        /// Remote host.
        host: String,
    },
}

/// One row of the transport descriptor file.
#[derive(Debug, Deserialize)]
struct TransportEntry {
    #[serde(default = "default_active")]
    active: bool,
    #[serde(flatten)]
    kind: TransportKind,
}

fn default_active() -> bool {
    true
}

/// A configured fetch worker.
#[derive(Debug, Clone)]
pub struct Transport {
    kind: TransportKind,
}

impl Transport {
    /// Wrap a descriptor.
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }

    /// A local in-process transport for `--local` runs.
    pub fn popen(script: PathBuf) -> Self {
        Self::new(TransportKind::Popen { script })
    }

    /// Provenance name of this transport.
    pub fn name(&self) -> String {
        match &self.kind {
            TransportKind::Popen { script } => script
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| script.display().to_string()),
            TransportKind::Sudo { user, .. } => format!("sudo:{user}"),
            TransportKind::Ssh { user, .. } => user.clone(),
        }
    }

    /// Provenance host of this transport.
    pub fn host(&self) -> &str {
        match &self.kind {
            TransportKind::Popen { .. } | TransportKind::Sudo { .. } => "localhost",
            TransportKind::Ssh { host, .. } => host,
        }
    }

    /// Fetch one window. Returns the raw stdout bytes on success.
    pub async fn fetch(
        &self,
        window: &str,
        keyword: &str,
        geo: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let (argv, stdin) = self.invocation(window, keyword, geo);
        run_command(&argv, stdin, FETCH_CEILING).await
    }

    fn invocation(
        &self,
        window: &str,
        keyword: &str,
        geo: Option<&str>,
    ) -> (Vec<String>, Option<Vec<u8>>) {
        match &self.kind {
            TransportKind::Popen { script } => {
                let mut argv = vec![
                    script.display().to_string(),
                    window.to_string(),
                    keyword.to_string(),
                ];
                argv.extend(geo.map(str::to_string));
                (argv, None)
            }
            TransportKind::Sudo {
                user,
                group,
                script,
            } => {
                let mut argv = vec![
                    "sudo".to_string(),
                    "-u".to_string(),
                    user.clone(),
                    "-g".to_string(),
                    group.clone(),
                    "/bin/sh".to_string(),
                    script.display().to_string(),
                    "fetch".to_string(),
                    window.to_string(),
                    keyword.to_string(),
                ];
                argv.extend(geo.map(str::to_string));
                (argv, None)
            }
            TransportKind::Ssh { user, host } => {
                let argv = vec![
                    "ssh".to_string(),
                    "-T".to_string(),
                    format!("{user}@{host}"),
                ];
                // The remote launcher decides whether geo is present by
                // whether the third line is empty.
                let stdin = format!("{window}\n{keyword}\n{}\n", geo.unwrap_or(""));
                (argv, Some(stdin.into_bytes()))
            }
        }
    }
}

/// Load the active transports from a descriptor file.
pub fn load_transports(path: &Path) -> anyhow::Result<Vec<Transport>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read transport config {}", path.display()))?;
    let entries: Vec<TransportEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parse transport config {}", path.display()))?;
    let transports: Vec<Transport> = entries
        .into_iter()
        .filter(|entry| entry.active)
        .map(|entry| Transport::new(entry.kind))
        .collect();
    anyhow::ensure!(
        !transports.is_empty(),
        "no active transports in {}",
        path.display()
    );
    Ok(transports)
}

async fn run_command(
    argv: &[String],
    stdin: Option<Vec<u8>>,
    ceiling: Duration,
) -> Result<Vec<u8>, FetchError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FetchError::Fatal("empty fetch command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| FetchError::Fatal(format!("spawn {program}: {err}")))?;

    if let Some(bytes) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| FetchError::Fatal("child stdin was not piped".to_string()))?;
        pipe.write_all(&bytes)
            .await
            .map_err(|err| FetchError::Fatal(format!("write stdin to {program}: {err}")))?;
        // Dropping the handle closes the pipe so the remote launcher sees EOF.
    }

    let output = match tokio::time::timeout(ceiling, child.wait_with_output()).await {
        Ok(res) => {
            res.map_err(|err| FetchError::Fatal(format!("wait for {program}: {err}")))?
        }
        Err(_) => {
            return Err(FetchError::Fatal(format!(
                "{program} timed out after {}s",
                ceiling.as_secs()
            )));
        }
    };

    if output.status.success() {
        return Ok(output.stdout);
    }

    if output.status.code() == Some(UPSTREAM_ERROR_EXIT) {
        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(&output.stdout) {
            return Err(FetchError::Response {
                code: envelope.error.code,
                msg: envelope.error.msg,
            });
        }
    }

    error!(
        program = %program,
        status = %output.status,
        stdout = %String::from_utf8_lossy(&output.stdout),
        stderr = %String::from_utf8_lossy(&output.stderr),
        "fetch subprocess failed"
    );
    Err(FetchError::Fatal(format!(
        "{program} exited with {}",
        output.status
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn successful_run_returns_stdout() {
        let out = run_command(&sh("printf 'payload'"), None, FETCH_CEILING)
            .await
            .unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn exit_five_with_envelope_is_a_structured_error() {
        let out = run_command(
            &sh(r#"printf '{"error":{"code":500,"msg":"quota"}}'; exit 5"#),
            None,
            FETCH_CEILING,
        )
        .await;
        match out {
            Err(FetchError::Response { code, msg }) => {
                assert_eq!(code, 500);
                assert_eq!(msg, "quota");
            }
            other => panic!("expected structured error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_five_without_envelope_is_fatal() {
        let out = run_command(&sh("printf 'garbage'; exit 5"), None, FETCH_CEILING).await;
        assert!(matches!(out, Err(FetchError::Fatal(_))));
    }

    #[tokio::test]
    async fn other_nonzero_exits_are_fatal() {
        let out = run_command(&sh("exit 3"), None, FETCH_CEILING).await;
        assert!(matches!(out, Err(FetchError::Fatal(_))));
    }

    #[tokio::test]
    async fn stdin_reaches_the_subprocess() {
        let out = run_command(&sh("cat"), Some(b"w\nk\n\n".to_vec()), FETCH_CEILING)
            .await
            .unwrap();
        assert_eq!(out, b"w\nk\n\n");
    }

    #[tokio::test]
    async fn slow_subprocesses_hit_the_ceiling() {
        let out = run_command(&sh("sleep 5"), None, Duration::from_millis(200)).await;
        match out {
            Err(FetchError::Fatal(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn popen_invocation_appends_geo_when_present() {
        let t = Transport::popen(PathBuf::from("/opt/fetch_trends"));
        let (argv, stdin) = t.invocation("2022-01-01T00 2022-01-01T12", "solar", Some("US"));
        assert_eq!(
            argv,
            vec!["/opt/fetch_trends", "2022-01-01T00 2022-01-01T12", "solar", "US"]
        );
        assert!(stdin.is_none());

        let (argv, _) = t.invocation("w", "k", None);
        assert_eq!(argv.len(), 3);
        assert_eq!(t.name(), "fetch_trends");
        assert_eq!(t.host(), "localhost");
    }

    #[test]
    fn sudo_invocation_elevates_through_a_shell() {
        let t = Transport::new(TransportKind::Sudo {
            user: "miner".into(),
            group: "miners".into(),
            script: PathBuf::from("/opt/fetch_trends"),
        });
        let (argv, stdin) = t.invocation("w", "k", Some("DE"));
        assert_eq!(
            argv,
            vec![
                "sudo", "-u", "miner", "-g", "miners", "/bin/sh", "/opt/fetch_trends",
                "fetch", "w", "k", "DE"
            ]
        );
        assert!(stdin.is_none());
        assert_eq!(t.name(), "sudo:miner");
    }

    #[test]
    fn ssh_invocation_passes_the_request_on_stdin() {
        let t = Transport::new(TransportKind::Ssh {
            user: "miner".into(),
            host: "crawler-2".into(),
        });
        let (argv, stdin) = t.invocation("w", "k", None);
        assert_eq!(argv, vec!["ssh", "-T", "miner@crawler-2"]);
        assert_eq!(stdin.unwrap(), b"w\nk\n\n");

        let (_, stdin) = t.invocation("w", "k", Some("US"));
        assert_eq!(stdin.unwrap(), b"w\nk\nUS\n");
        assert_eq!(t.name(), "miner");
        assert_eq!(t.host(), "crawler-2");
    }

    #[test]
    fn descriptor_file_parses_and_filters_inactive_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transports.json");
        std::fs::write(
            &path,
            r#"[
                {"type": "popen", "script": "/opt/fetch_trends"},
                {"active": false, "type": "ssh", "user": "miner", "host": "crawler-1"},
                {"active": true, "type": "sudo", "user": "miner", "group": "miners", "script": "/opt/fetch_trends"}
            ]"#,
        )
        .unwrap();

        let transports = load_transports(&path).unwrap();
        assert_eq!(transports.len(), 2);
        assert_eq!(transports[0].name(), "fetch_trends");
        assert_eq!(transports[1].name(), "sudo:miner");
    }

    #[test]
    fn all_inactive_descriptors_are_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transports.json");
        std::fs::write(
            &path,
            r#"[{"active": false, "type": "popen", "script": "/opt/fetch_trends"}]"#,
        )
        .unwrap();
        assert!(load_transports(&path).is_err());
    }
}
