//! The opaque "deliver" operation and the transports shipped with herald

use std::{fmt::Write as _, path::PathBuf, process::Stdio, sync::Arc};

use async_trait::async_trait;
use herald_common::outgoing;
use herald_store::QueuedMessage;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

/// Result of handing one item to a transport
///
/// The worker decides retry-versus-abort on this tag alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Worth retrying later; the item is deferred
    Transient(String),
    /// The transport itself is unusable; the cycle is aborted
    Permanent(String),
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, message: &QueuedMessage) -> DeliveryOutcome;
}

/// Strip CR and LF so a field cannot inject extra headers
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// Render `message` as an RFC 5322 document with CRLF line endings
#[must_use]
pub fn render_message(message: &QueuedMessage) -> String {
    let domain = message
        .from_address
        .rsplit_once('@')
        .map_or("localhost", |(_, domain)| domain);
    let date = chrono::DateTime::<chrono::Utc>::from(message.enqueued_at).to_rfc2822();

    let mut rendered = String::with_capacity(message.body.len() + 256);
    let _ = write!(
        rendered,
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {date}\r\nMessage-ID: <{}@{}>\r\n\
         MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\
         Content-Transfer-Encoding: 8bit\r\n\r\n",
        header_value(&message.from_address),
        header_value(&message.to_address),
        header_value(&message.subject),
        message.id,
        header_value(domain),
    );

    for line in message.body.lines() {
        rendered.push_str(line);
        rendered.push_str("\r\n");
    }

    rendered
}

/// Logs each message and reports it delivered. Useful for development.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, message: &QueuedMessage) -> DeliveryOutcome {
        outgoing!(
            level = INFO,
            "Delivering {} to {} ({} bytes): {}",
            message.id,
            message.to_address,
            message.body.len(),
            message.subject
        );
        DeliveryOutcome::Delivered
    }
}

/// Writes every message to `<path>/<id>.eml`
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    path: PathBuf,
}

impl DirectoryTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Transport for DirectoryTransport {
    async fn deliver(&self, message: &QueuedMessage) -> DeliveryOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&self.path).await {
            return DeliveryOutcome::Transient(format!(
                "cannot create {}: {e}",
                self.path.display()
            ));
        }

        let target = self.path.join(format!("{}.eml", message.id));
        let temp = self.path.join(format!(".tmp_{}.eml", message.id));

        let written = async {
            tokio::fs::write(&temp, render_message(message)).await?;
            tokio::fs::rename(&temp, &target).await
        }
        .await;

        match written {
            Ok(()) => {
                outgoing!("Wrote {} to {}", message.id, target.display());
                DeliveryOutcome::Delivered
            }
            Err(e) => DeliveryOutcome::Transient(format!("cannot write {}: {e}", target.display())),
        }
    }
}

/// Pipes each message into a sendmail-compatible binary
///
/// Exit codes follow `sysexits.h`: 0 is success, configuration and internal
/// failures (`EX_UNAVAILABLE`, `EX_SOFTWARE`, `EX_OSERR`, `EX_CONFIG`) are
/// permanent, everything else is worth retrying.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    command: PathBuf,
    args: Vec<String>,
}

const EX_UNAVAILABLE: i32 = 69;
const EX_SOFTWARE: i32 = 70;
const EX_OSERR: i32 = 71;
const EX_CONFIG: i32 = 78;

impl SendmailTransport {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn classify(code: Option<i32>, stderr: &str) -> DeliveryOutcome {
        let stderr = stderr.trim();
        match code {
            Some(0) => DeliveryOutcome::Delivered,
            Some(code @ (EX_UNAVAILABLE | EX_SOFTWARE | EX_OSERR | EX_CONFIG)) => {
                DeliveryOutcome::Permanent(format!("sendmail exited with {code}: {stderr}"))
            }
            Some(code) => DeliveryOutcome::Transient(format!("sendmail exited with {code}: {stderr}")),
            None => DeliveryOutcome::Transient(format!("sendmail killed by signal: {stderr}")),
        }
    }
}

#[async_trait]
impl Transport for SendmailTransport {
    async fn deliver(&self, message: &QueuedMessage) -> DeliveryOutcome {
        let spawned = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return DeliveryOutcome::Permanent(format!(
                    "{} not found: {e}",
                    self.command.display()
                ));
            }
            Err(e) => return DeliveryOutcome::Transient(format!("cannot spawn sendmail: {e}")),
        };

        // Feed stdin while stderr is drained, or a chatty sendmail blocks on
        // a full pipe before it reads the whole message
        let stdin = child.stdin.take();
        let rendered = render_message(message);
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(rendered.as_bytes()).await?;
                // Closing stdin lets sendmail see the end of the message
                drop(stdin);
            }
            Ok::<(), std::io::Error>(())
        };

        let (fed, finished) = tokio::join!(feed, child.wait_with_output());

        match finished {
            Ok(output) => {
                let outcome = match fed {
                    Err(e) if output.status.success() => {
                        DeliveryOutcome::Transient(format!("cannot write to sendmail: {e}"))
                    }
                    _ => Self::classify(
                        output.status.code(),
                        &String::from_utf8_lossy(&output.stderr),
                    ),
                };
                outgoing!("sendmail for {}: {outcome:?}", message.id);
                outcome
            }
            Err(e) => DeliveryOutcome::Transient(format!("sendmail did not finish: {e}")),
        }
    }
}

fn default_sendmail() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

fn default_sendmail_args() -> Vec<String> {
    vec!["-t".to_string(), "-i".to_string()]
}

/// Transport selection in configuration
///
/// ```ron
/// transport: Sendmail(command: "/usr/sbin/sendmail", args: ["-t", "-i"]),
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub enum TransportConfig {
    #[default]
    Log,
    Directory {
        path: PathBuf,
    },
    Sendmail {
        #[serde(default = "default_sendmail")]
        command: PathBuf,
        #[serde(default = "default_sendmail_args")]
        args: Vec<String>,
    },
}

impl TransportConfig {
    #[must_use]
    pub fn build(&self) -> Arc<dyn Transport> {
        match self {
            Self::Log => Arc::new(LogTransport),
            Self::Directory { path } => Arc::new(DirectoryTransport::new(path.clone())),
            Self::Sendmail { command, args } => {
                Arc::new(SendmailTransport::new(command.clone(), args.clone()))
            }
        }
    }
}
