use fleet_core::lines::{classify_line, parse_json_document, sanitize_line, OutputLine};
use fleet_core::{parse_snapshot, parse_stats, FleetMember, MemberStats};
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

pub const LIST_COMMAND: &str = "list-json";
pub const STATS_COMMAND: &str = "monitor-json";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("control plane io error: {0}")]
    Io(#[from] io::Error),
    #[error("control plane timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed control plane output: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub trait ControlPlane: Send + Sync + 'static {
    /// Runs `command` to completion and buffers its sanitized output.
    fn invoke(
        &self,
        command: &str,
        args: &[String],
    ) -> impl Future<Output = Result<Invocation, AdapterError>> + Send;

    /// Runs `command`, pushing each non-blank output line into `sink` as soon
    /// as it is read. Resolves to the exit code.
    fn stream(
        &self,
        command: &str,
        args: &[String],
        sink: mpsc::Sender<OutputLine>,
    ) -> impl Future<Output = Result<Option<i32>, AdapterError>> + Send;
}

/// Runs `program prefix_args... command args...` as a child process, never
/// through a shell. Output lines are sanitized before anything else looks at
/// them.
#[derive(Debug, Clone)]
pub struct ProcessControlPlane {
    program: String,
    prefix_args: Vec<String>,
    timeout: Duration,
}

impl ProcessControlPlane {
    pub fn new(program: impl Into<String>, prefix_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prefix_args,
            timeout,
        }
    }

    fn command(&self, command: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .arg(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> AdapterError {
        AdapterError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

impl ControlPlane for ProcessControlPlane {
    async fn invoke(&self, command: &str, args: &[String]) -> Result<Invocation, AdapterError> {
        let child = self
            .command(command, args)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        // dropping the future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AdapterError::Timeout(self.timeout))??;
        Ok(Invocation {
            exit_code: output.status.code(),
            stdout_lines: clean_lines(&output.stdout),
            stderr_lines: clean_lines(&output.stderr),
        })
    }

    async fn stream(
        &self,
        command: &str,
        args: &[String],
        sink: mpsc::Sender<OutputLine>,
    ) -> Result<Option<i32>, AdapterError> {
        let mut child = self
            .command(command, args)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            let (out, err) = tokio::join!(
                forward_lines(stdout, sink.clone()),
                forward_lines(stderr, sink.clone())
            );
            out?;
            err?;
            child.wait().await
        };
        let result = tokio::time::timeout(self.timeout, run).await;
        match result {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                let _ = child.start_kill();
                Err(AdapterError::Timeout(self.timeout))
            }
        }
    }
}

/// Reads `reader` line by line until EOF. Lines keep being drained after the
/// sink closes so the child never blocks on a full pipe.
async fn forward_lines<R>(reader: Option<R>, sink: mpsc::Sender<OutputLine>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut open = true;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        if !open {
            continue;
        }
        if let Some(line) = classify_line(&String::from_utf8_lossy(&buf)) {
            open = sink.send(line).await.is_ok();
        }
    }
}

fn clean_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(sanitize_line)
        .filter(|line| !line.is_empty())
        .collect()
}

/// One `list-json` call. Anything that does not parse as a snapshot is
/// `Malformed`.
pub async fn fetch_snapshot<P: ControlPlane>(plane: &P) -> Result<Vec<FleetMember>, AdapterError> {
    let invocation = plane.invoke(LIST_COMMAND, &[]).await?;
    let value = parse_json_document(&invocation.stdout_lines).ok_or_else(|| {
        AdapterError::Malformed(format!(
            "{LIST_COMMAND} produced no JSON (exit {:?})",
            invocation.exit_code
        ))
    })?;
    parse_snapshot(value).map_err(|err| AdapterError::Malformed(err.to_string()))
}

pub async fn fetch_stats<P: ControlPlane>(plane: &P, name: &str) -> Result<MemberStats, AdapterError> {
    let invocation = plane.invoke(STATS_COMMAND, &[name.to_string()]).await?;
    let value = parse_json_document(&invocation.stdout_lines).ok_or_else(|| {
        AdapterError::Malformed(format!("{STATS_COMMAND} produced no JSON for {name}"))
    })?;
    parse_stats(value, name).map_err(|err| AdapterError::Malformed(err.to_string()))
}


#[cfg(test)]
mod tests {
    use super::scripted::{ScriptedControlPlane, ScriptedResponse};
    use super::*;
    use fleet_core::MemberState;

    #[tokio::test]
    async fn snapshot_parses_multi_line_json() {
        let plane = ScriptedControlPlane::new();
        plane.respond(
            LIST_COMMAND,
            ScriptedResponse::ok(&[
                "[",
                r#"{"Name":"alpha","State":"Running","Memory":"1GB","Disk":"--"},"#,
                r#"{"Name":"beta","State":"Stopped"}"#,
                "]",
            ]),
        );
        let members = fetch_snapshot(&plane).await.expect("snapshot");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].state, MemberState::Running);
        assert_eq!(members[1].name, "beta");
    }

    #[tokio::test]
    async fn empty_or_garbled_snapshot_is_malformed() {
        let plane = ScriptedControlPlane::new();
        assert!(matches!(
            fetch_snapshot(&plane).await,
            Err(AdapterError::Malformed(_))
        ));

        plane.respond(LIST_COMMAND, ScriptedResponse::ok(&["Access is denied."]));
        assert!(matches!(
            fetch_snapshot(&plane).await,
            Err(AdapterError::Malformed(_))
        ));

        plane.respond(
            LIST_COMMAND,
            ScriptedResponse::ok(&[r#"[{"Name":"x","State":"Converting"}]"#]),
        );
        assert!(matches!(
            fetch_snapshot(&plane).await,
            Err(AdapterError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn stats_use_requested_name_when_missing() {
        let plane = ScriptedControlPlane::new();
        plane.respond(
            "monitor-json alpha",
            ScriptedResponse::ok(&[r#"{"Memory":"512MB","Disk":"3GB"}"#]),
        );
        let stats = fetch_stats(&plane, "alpha").await.expect("stats");
        assert_eq!(stats.name, "alpha");
        assert_eq!(stats.memory.as_deref(), Some("512MB"));
        assert_eq!(plane.commands(), vec!["monitor-json alpha".to_string()]);
    }

    #[cfg(unix)]
    fn shell() -> ProcessControlPlane {
        ProcessControlPlane::new("sh", vec!["-c".to_string()], Duration::from_secs(5))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_invoke_buffers_sanitized_output() {
        let plane = shell();
        let invocation = plane
            .invoke(
                r#"printf '  [{"Name":"a","State":"Stopped"}]\r\n\n'; echo oops >&2; exit 3"#,
                &[],
            )
            .await
            .expect("invoke");
        assert_eq!(invocation.exit_code, Some(3));
        assert!(!invocation.success());
        assert_eq!(
            invocation.stdout_lines,
            vec![r#"[{"Name":"a","State":"Stopped"}]"#.to_string()]
        );
        assert_eq!(invocation.stderr_lines, vec!["oops".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_stream_emits_lines_and_exit_code() {
        let plane = shell();
        let (tx, mut rx) = mpsc::channel(16);
        let code = plane
            .stream("echo '[INFO] one'; echo '{\"k\":1}'; exit 0", &[], tx)
            .await
            .expect("stream");
        assert_eq!(code, Some(0));
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&OutputLine::Diagnostic("[INFO] one".to_string())));
        assert!(lines.contains(&OutputLine::Structured {
            text: r#"{"k":1}"#.to_string(),
            value: serde_json::json!({"k": 1}),
        }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_arguments_are_not_shell_expanded() {
        // `sh -c <script> <arg0> <arg1>`: the name only reaches the script as $1
        let plane = shell();
        let invocation = plane
            .invoke(
                "printf '%s' \"$1\"",
                &["sh".to_string(), "a;rm -rf /tmp/nothing".to_string()],
            )
            .await
            .expect("invoke");
        assert_eq!(
            invocation.stdout_lines,
            vec!["a;rm -rf /tmp/nothing".to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_children_time_out() {
        let plane = ProcessControlPlane::new(
            "sh",
            vec!["-c".to_string()],
            Duration::from_millis(100),
        );
        let result = plane.invoke("sleep 5", &[]).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let plane = ProcessControlPlane::new(
            "fleet-control-plane-that-does-not-exist",
            Vec::new(),
            Duration::from_secs(1),
        );
        let result = plane.invoke(LIST_COMMAND, &[]).await;
        assert!(matches!(result, Err(AdapterError::Spawn { .. })));
    }
}
