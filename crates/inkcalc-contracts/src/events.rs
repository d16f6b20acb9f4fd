use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::answers::ParseStage;

/// One step of an analysis session, as written to `events.jsonl`.
///
/// The variant picks the `type` field; the fields sit next to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum AnalysisEvent {
    #[serde(rename = "analysis_started")]
    Started {
        provider: String,
        prompt: String,
        image_width: u32,
        image_height: u32,
        image_sha256: String,
    },
    #[serde(rename = "model_replied")]
    ModelReplied {
        model: String,
        chars: usize,
        provider_response: Map<String, Value>,
    },
    #[serde(rename = "parse_failed")]
    ParseFailed {
        literal_error: String,
        json_error: String,
    },
    #[serde(rename = "analysis_finished")]
    Finished {
        outcome: String,
        entries: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<ParseStage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        warnings: Vec<String>,
    },
}

impl AnalysisEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "analysis_started",
            Self::ModelReplied { .. } => "model_replied",
            Self::ParseFailed { .. } => "parse_failed",
            Self::Finished { .. } => "analysis_finished",
        }
    }
}

#[derive(Serialize)]
struct EventRecord<'a> {
    #[serde(flatten)]
    event: &'a AnalysisEvent,
    session_id: &'a str,
    ts: String,
}

/// Append-only diagnostics log for analysis sessions.
///
/// Each line is one compact JSON object: the event fields plus `session_id`
/// and an RFC 3339 `ts`. Clones share the file and its lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Appends `event` and returns the row as written.
    pub fn emit(&self, event: &AnalysisEvent) -> anyhow::Result<Value> {
        let record = EventRecord {
            event,
            session_id: &self.inner.session_id,
            ts: now_utc_iso(),
        };
        let line = serde_json::to_string(&record)?;

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(serde_json::from_str(&line)?)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn finished(stage: Option<ParseStage>, error: Option<&str>) -> AnalysisEvent {
        AnalysisEvent::Finished {
            outcome: "answers".to_string(),
            entries: 2,
            stage,
            error: error.map(str::to_string),
            warnings: vec!["entry 1 has no 'expr'".to_string()],
        }
    }

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");

        let emitted = writer.emit(&finished(Some(ParseStage::Literal), None))?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        assert!(!line.contains(": "));
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("analysis_finished"));
        assert_eq!(parsed["session_id"], json!("session-1"));
        assert_eq!(parsed["entries"], json!(2));
        assert_eq!(parsed["stage"], json!("literal"));
        assert_eq!(parsed["warnings"], json!(["entry 1 has no 'expr'"]));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn absent_stage_and_error_are_left_out() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-1");

        let emitted = writer.emit(&finished(None, None))?;
        let row = emitted.as_object().cloned().unwrap_or_default();
        assert!(!row.contains_key("stage"));
        assert!(!row.contains_key("error"));

        let emitted = writer.emit(&finished(None, Some("connection reset")))?;
        assert_eq!(emitted["error"], json!("connection reset"));
        Ok(())
    }

    #[test]
    fn kind_matches_serialized_type() -> anyhow::Result<()> {
        let events = [
            AnalysisEvent::Started {
                provider: "dryrun".to_string(),
                prompt: "analyze_expression".to_string(),
                image_width: 512,
                image_height: 200,
                image_sha256: "00".repeat(32),
            },
            AnalysisEvent::ModelReplied {
                model: "gemini-1.5-flash".to_string(),
                chars: 12,
                provider_response: Map::new(),
            },
            AnalysisEvent::ParseFailed {
                literal_error: "bad".to_string(),
                json_error: "worse".to_string(),
            },
            finished(Some(ParseStage::Json), None),
        ];
        for event in &events {
            let value = serde_json::to_value(event)?;
            assert_eq!(value["type"], json!(event.kind()));
        }
        assert_eq!(serde_json::to_value(&events[0])?["image_width"], json!(512));
        Ok(())
    }

    #[test]
    fn emit_appends_lines_across_clones() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");
        let shared = writer.clone();

        writer.emit(&AnalysisEvent::ParseFailed {
            literal_error: "bad".to_string(),
            json_error: "worse".to_string(),
        })?;
        shared.emit(&finished(None, None))?;

        let content = fs::read_to_string(&path)?;
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types, vec!["parse_failed", "analysis_finished"]);
        assert_eq!(shared.path(), path.as_path());
        assert_eq!(shared.session_id(), "session-1");
        Ok(())
    }
}
