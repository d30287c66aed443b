//! Line protocol spoken by external tools on stdout.
//!
//! Each record is one JSON object per line:
//!
//! ```text
//! {"v":1,"kind":"progress","process_id":"…","stage":"video","percent":40}
//! {"v":1,"kind":"error","process_id":"…","message":"codec error"}
//! {"v":1,"kind":"complete","process_id":"…","output":"/out/sample.mp4"}
//! ```
//!
//! Tools that predate the JSON records print `PROGRESS:<id>:<stage>:<pct>`,
//! `ERROR:<id>:<message>` or a line containing `COMPLETE:<id>`; those decode
//! into the same messages. Anything else is ordinary log output.

use serde::{Deserialize, Serialize};

/// Current protocol version. Records with any other version are ignored.
pub const PROTOCOL_VERSION: u32 = 1;

/// A structured message emitted by a tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolMessage {
    Progress { stage: String, percent: u8 },
    Error { message: String },
    Complete { output: Option<String> },
}

/// A decoded line, keyed by the process that emitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedMessage {
    /// `None` when the tool did not say which process it belongs to
    pub process_id: Option<String>,
    pub message: ToolMessage,
}

impl TaggedMessage {
    /// Whether the message is addressed to `process_id` (untagged messages match anything).
    pub fn is_for(&self, process_id: &str) -> bool {
        self.process_id.as_deref().map_or(true, |id| id == process_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordKind {
    Progress,
    Error,
    Complete,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    v: u32,
    kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

/// Decode one line of tool output. Returns `None` for plain log lines.
pub fn decode_line(line: &str) -> Option<TaggedMessage> {
    let line = line.trim();
    if line.starts_with('{') {
        return decode_record(line);
    }
    decode_legacy(line)
}

/// Encode a message as a protocol line (without trailing newline).
pub fn encode(process_id: Option<&str>, message: &ToolMessage) -> String {
    let mut record = Record {
        v: PROTOCOL_VERSION,
        kind: RecordKind::Progress,
        process_id: process_id.map(str::to_string),
        stage: None,
        percent: None,
        message: None,
        output: None,
    };
    match message {
        ToolMessage::Progress { stage, percent } => {
            record.stage = Some(stage.clone());
            record.percent = Some(f64::from(*percent));
        }
        ToolMessage::Error { message } => {
            record.kind = RecordKind::Error;
            record.message = Some(message.clone());
        }
        ToolMessage::Complete { output } => {
            record.kind = RecordKind::Complete;
            record.output = output.clone();
        }
    }
    serde_json::to_string(&record).unwrap_or_default()
}

fn decode_record(line: &str) -> Option<TaggedMessage> {
    let record: Record = serde_json::from_str(line).ok()?;
    if record.v != PROTOCOL_VERSION {
        return None;
    }
    let message = match record.kind {
        RecordKind::Progress => ToolMessage::Progress {
            stage: record.stage?,
            percent: clamp_percent(record.percent?),
        },
        RecordKind::Error => ToolMessage::Error {
            message: record.message.unwrap_or_else(|| "unknown error".to_string()),
        },
        RecordKind::Complete => ToolMessage::Complete {
            output: record.output.filter(|o| !o.is_empty()),
        },
    };
    Some(TaggedMessage {
        process_id: record.process_id,
        message,
    })
}

fn decode_legacy(line: &str) -> Option<TaggedMessage> {
    if let Some(rest) = line.strip_prefix("PROGRESS:") {
        let mut parts = rest.splitn(3, ':');
        let id = parts.next()?;
        let stage = parts.next()?;
        let percent: f64 = parts.next()?.trim().trim_end_matches('%').parse().ok()?;
        return Some(TaggedMessage {
            process_id: non_empty(id),
            message: ToolMessage::Progress {
                stage: stage.to_string(),
                percent: clamp_percent(percent),
            },
        });
    }

    if let Some(rest) = line.strip_prefix("ERROR:") {
        let (id, message) = rest.split_once(':')?;
        return Some(TaggedMessage {
            process_id: non_empty(id),
            message: ToolMessage::Error {
                message: message.trim().to_string(),
            },
        });
    }

    let (_, rest) = line.split_once("COMPLETE:")?;
    let rest = rest.trim();
    let (id, output) = match rest.split_once(':') {
        Some((id, output)) => (id, non_empty(output.trim())),
        None => (rest.split_whitespace().next().unwrap_or(""), None),
    };
    Some(TaggedMessage {
        process_id: non_empty(id),
        message: ToolMessage::Complete { output },
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}
