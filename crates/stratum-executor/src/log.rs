//! Recorded job logs.
//!
//! Each job may record every message it emits to its own file under the
//! log directory, and forwards the same messages to an observer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stratum_core::{JobId, JobKey, Message, MessageSink, MessageType};
use tracing::warn;

const INDENT: &str = "    ";
const EMPTY_TIME: &str = "--:--:--";

/// Receives every message emitted by running jobs.
pub trait MessageForwarder: Send + Sync {
    fn forward(&self, job: JobId, key: &JobKey, message: &Message);
}

/// Render a message as one log file entry.
///
/// ```text
/// [00:01:05] SUCCESS base: Building
/// ```
///
/// Only completion messages carry a timecode. Detail follows after a
/// blank line, indented.
pub fn format_message(message: &Message) -> String {
    let timecode = match (message.message_type.is_completion(), message.elapsed) {
        (true, Some(elapsed)) => {
            let secs = elapsed.as_secs();
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        _ => EMPTY_TIME.to_string(),
    };

    let mut text = format!("[{: <8}] {: <7}", timecode, message.message_type.as_str());
    if let Some(element) = &message.element {
        text.push(' ');
        text.push_str(element.as_str());
    }
    text.push_str(": ");
    text.push_str(&message.text);

    if let Some(detail) = &message.detail {
        text.push_str("\n\n");
        let detail = detail.trim_end_matches('\n');
        for (i, line) in detail.split('\n').enumerate() {
            if i > 0 {
                text.push('\n');
            }
            text.push_str(INDENT);
            text.push_str(line);
        }
    }

    text
}

/// An open per-job log file.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl JobLog {
    /// Open `<dir>/<action>/<element>.<job>.log` for appending.
    pub fn create(dir: &Path, job: JobId, key: &JobKey) -> io::Result<Self> {
        let path = dir
            .join(key.action.as_str())
            .join(format!("{}.{}.log", key.element, job));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, message: &Message) {
        self.write_line(&format_message(message));
    }

    /// Note that the job was torn down before it could finish.
    pub fn record_forced_termination(&self) {
        self.write_line("\n\nForcefully terminated");
    }

    fn write_line(&self, line: &str) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write job log");
        }
    }
}

/// The message sink handed to a job's action.
pub struct JobMessenger {
    job: JobId,
    key: JobKey,
    log: Option<JobLog>,
    forwarder: Option<Arc<dyn MessageForwarder>>,
}

impl JobMessenger {
    pub fn new(
        job: JobId,
        key: JobKey,
        log: Option<JobLog>,
        forwarder: Option<Arc<dyn MessageForwarder>>,
    ) -> Self {
        Self {
            job,
            key,
            log,
            forwarder,
        }
    }

    pub fn log(&self) -> Option<&JobLog> {
        self.log.as_ref()
    }
}

impl MessageSink for JobMessenger {
    fn message(&self, message: Message) {
        if let Some(log) = &self.log {
            log.record(&message);
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(self.job, &self.key, &message);
        }
        if message.message_type == MessageType::Error {
            warn!(job = %self.key, "{}", message.text);
        }
    }
}
