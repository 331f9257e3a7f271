use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    domain::{ChatId, UpdateId},
    errors::{Error, Failure},
    Result,
};

const AUDIT_MAX_TEXT: usize = 500;

/// One handled update, as written to the audit log.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,
    pub update_id: i64,
    pub chat_id: i64,
    pub sender: String,
    pub route: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl AuditEvent {
    pub fn handled(
        update_id: UpdateId,
        chat_id: ChatId,
        sender: &str,
        route: &str,
        content: &str,
        response: &str,
        failure: Option<Failure>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event: if failure.is_some() { "failed" } else { "handled" }.to_string(),
            update_id: update_id.0,
            chat_id: chat_id.0,
            sender: sender.to_string(),
            route: route.to_string(),
            content: Some(content.to_string()),
            response: Some(response.to_string()),
            failure,
        }
    }
}

/// Append-only audit trail (plain text blocks or JSON lines).
#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.content {
            event.content = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }
        if let Some(s) = &event.response {
            event.response = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::Storage(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            out.push_str(&json_value_to_display(v));
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn truncate_text_adds_ellipsis() {
        let s = "a".repeat(AUDIT_MAX_TEXT + 10);
        let t = truncate_text(&s, AUDIT_MAX_TEXT);
        assert!(t.ends_with("..."));
        assert_eq!(t.chars().count(), AUDIT_MAX_TEXT + 3);
        assert_eq!(truncate_text("short", AUDIT_MAX_TEXT), "short");
    }

    #[test]
    fn json_lines_are_truncated_and_carry_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLogger::new(dir.path().join("audit.log"), true);
        let content = "x".repeat(AUDIT_MAX_TEXT + 1);
        let failure = Failure {
            kind: ErrorKind::Storage,
            internal: "disk full".into(),
            message: "Something went wrong".into(),
        };
        let ev = AuditEvent::handled(
            UpdateId(7),
            ChatId(42),
            "Aroha",
            "expense",
            &content,
            "Something went wrong",
            Some(failure),
        );
        log.write(ev).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let line: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(line["event"], "failed");
        assert_eq!(line["update_id"], 7);
        assert_eq!(line["failure"]["kind"], "storage");
        assert!(line["content"].as_str().unwrap().ends_with("..."));
    }

    #[test]
    fn plain_text_blocks_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLogger::new(dir.path().join("audit.log"), false);
        for id in [1, 2] {
            let ev = AuditEvent::handled(UpdateId(id), ChatId(1), "u", "command", "!help", "ok", None);
            log.write(ev).unwrap();
        }
        let written = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(written.matches(&"=".repeat(60)).count(), 2);
        assert!(written.contains("route: command"));
    }
}
