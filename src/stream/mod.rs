/// Server-to-client reply stream
///
/// Every caller request gets one stream. Workflows push log lines, raw stdout
/// and progress updates into it; delivery is fire-and-forget and a broken
/// stream never fails the workflow that feeds it.
pub mod progress;

use crate::agent::ServiceStatus;
use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Size of each stdout/stderr chunk relayed from a child process
pub const EXEC_CHUNK_SIZE: usize = 1024;

/// Severity attached to a streamed log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

/// One frame of a reply stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubReply {
    Log { message: String, level: LogLevel },
    Stdout { text: String },
    /// First update for a label carries the bar's total, later ones advance it
    Progress { label: String, total: u32 },
    Statuses { statuses: Vec<ServiceStatus> },
    /// Successful end of stream
    Done,
    /// Terminal failure
    Error { message: String },
}

impl HubReply {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HubReply::Done | HubReply::Error { .. })
    }
}

/// Sink a reply stream writes into
pub trait ReplySender: Send + Sync {
    fn send(&self, reply: HubReply) -> HubResult<()>;
}

/// Sender backed by an unbounded channel, drained by the server connection
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<HubReply>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::UnboundedSender<HubReply>) -> Self {
        Self { tx }
    }
}

impl ReplySender for ChannelSender {
    fn send(&self, reply: HubReply) -> HubResult<()> {
        self.tx
            .send(reply)
            .map_err(|_| HubError::Stream {
                message: "reply stream closed".to_string(),
            })
    }
}

/// Handle workflows use to talk to their caller
#[derive(Clone)]
pub struct HubStream {
    sender: Arc<dyn ReplySender>,
}

impl HubStream {
    pub fn new(sender: Arc<dyn ReplySender>) -> Self {
        Self { sender }
    }

    /// Stream plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HubReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Arc::new(ChannelSender::new(tx))), rx)
    }

    pub fn send_log<S: Into<String>>(&self, message: S) {
        self.send_log_level(message, LogLevel::Info);
    }

    pub fn send_log_level<S: Into<String>>(&self, message: S, level: LogLevel) {
        let message = message.into();
        debug!("[{}] {}", level, message);
        self.deliver(HubReply::Log { message, level });
    }

    pub fn send_stdout<S: Into<String>>(&self, text: S) {
        self.deliver(HubReply::Stdout { text: text.into() });
    }

    pub fn send_progress<S: Into<String>>(&self, label: S, total: u32) {
        self.deliver(HubReply::Progress {
            label: label.into(),
            total,
        });
    }

    fn deliver(&self, reply: HubReply) {
        if let Err(e) = self.sender.send(reply) {
            error!("failed to send stream message: {}", e);
        }
    }
}

/// Run a local command to completion, relaying its stdout and stderr to the
/// stream in chunks as they arrive.
pub async fn exec_command(stream: &HubStream, mut cmd: Command) -> HubResult<()> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    debug!("Executing {:?}", cmd.as_std());

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HubError::command(format!("executing {}: {}", program, e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    supervise(stream, &program, &mut child, stdout, stderr).await
}

/// Relay the child's output, then reap it. A relay failure kills the child
/// first; the exit status is always collected before any error is returned.
async fn supervise<O, E>(
    stream: &HubStream,
    program: &str,
    child: &mut Child,
    stdout: Option<O>,
    stderr: Option<E>,
) -> HubResult<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (out, err) = tokio::join!(relay(stream, stdout), relay(stream, stderr));

    let relayed = out.and(err);
    if relayed.is_err() {
        if let Err(e) = child.start_kill() {
            debug!("Failed to kill {}: {}", program, e);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| HubError::command(format!("executing {}: {}", program, e)))?;
    relayed.map_err(|e| e.context(format!("relaying output of {}", program)))?;

    if status.success() {
        Ok(())
    } else {
        Err(HubError::command(format!("executing {}: {}", program, status)))
    }
}

async fn relay<R: AsyncRead + Unpin>(stream: &HubStream, reader: Option<R>) -> HubResult<()> {
    let mut reader = match reader {
        Some(reader) => reader,
        None => return Ok(()),
    };

    let mut buf = [0u8; EXEC_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.send_stdout(String::from_utf8_lossy(&buf[..n]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<HubReply>) -> Vec<HubReply> {
        let mut replies = Vec::new();
        while let Ok(reply) = rx.try_recv() {
            replies.push(reply);
        }
        replies
    }

    #[test]
    fn test_send_log_defaults_to_info() {
        let (stream, mut rx) = HubStream::channel();
        stream.send_log("Creating coordinator segment");
        stream.send_log_level("low disk", LogLevel::Warning);
        stream.send_progress("Validating Hosts:", 2);

        assert_eq!(
            drain(&mut rx),
            vec![
                HubReply::Log {
                    message: "Creating coordinator segment".to_string(),
                    level: LogLevel::Info
                },
                HubReply::Log {
                    message: "low disk".to_string(),
                    level: LogLevel::Warning
                },
                HubReply::Progress {
                    label: "Validating Hosts:".to_string(),
                    total: 2
                },
            ]
        );
    }

    #[test]
    fn test_closed_stream_does_not_panic() {
        let (stream, rx) = HubStream::channel();
        drop(rx);
        stream.send_log("nobody is listening");
        stream.send_stdout("still fine");
    }

    #[test]
    fn test_reply_wire_format() {
        let json = serde_json::to_string(&HubReply::Progress {
            label: "Initializing primary segments:".to_string(),
            total: 2,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"progress","label":"Initializing primary segments:","total":2}"#
        );

        let reply: HubReply = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(reply.is_terminal());
    }

    #[tokio::test]
    async fn test_exec_command_relays_both_descriptors() {
        let (stream, mut rx) = HubStream::channel();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2");

        exec_command(&stream, cmd).await.unwrap();

        let text: String = drain(&mut rx)
            .into_iter()
            .filter_map(|reply| match reply {
                HubReply::Stdout { text } => Some(text),
                _ => None,
            })
            .collect();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "read failed",
            )))
        }
    }

    #[tokio::test]
    async fn test_relay_failure_reaps_child() {
        let (stream, _rx) = HubStream::channel();
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervise(
                &stream,
                "sleep",
                &mut child,
                Some(FailingReader),
                None::<FailingReader>,
            ),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(err.to_string().starts_with("relaying output of sleep: "));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exec_command_non_zero_exit() {
        let (stream, _rx) = HubStream::channel();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");

        let err = exec_command(&stream, cmd).await.unwrap_err();
        assert!(matches!(err, HubError::Command { .. }));
        assert!(err.to_string().starts_with("executing sh:"));
    }
}
