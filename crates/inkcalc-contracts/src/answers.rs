use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::literal::parse_literal;
use crate::normalize::normalize_response_text;

/// Caller-supplied `name -> value` bindings. Insertion order is kept so the
/// prompt lists variables the way the caller declared them.
pub type VariableBindings = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub expr: String,
    pub result: Value,
    #[serde(default)]
    pub assign: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStage {
    Literal,
    Json,
}

impl ParseStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::Json => "json",
        }
    }
}

/// Result of the two-stage answer parse.
///
/// `Parsed` with no entries means the model really answered with an empty
/// list (or nothing entry-shaped); `Unparseable` means neither parser could
/// read the text at all.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed {
        stage: ParseStage,
        entries: Vec<AnswerEntry>,
        warnings: Vec<String>,
    },
    Unparseable {
        literal_error: String,
        json_error: String,
    },
}

impl ParseOutcome {
    pub fn entries(&self) -> &[AnswerEntry] {
        match self {
            Self::Parsed { entries, .. } => entries,
            Self::Unparseable { .. } => &[],
        }
    }

    pub fn into_entries(self) -> Vec<AnswerEntry> {
        match self {
            Self::Parsed { entries, .. } => entries,
            Self::Unparseable { .. } => Vec::new(),
        }
    }

    pub fn stage(&self) -> Option<ParseStage> {
        match self {
            Self::Parsed { stage, .. } => Some(*stage),
            Self::Unparseable { .. } => None,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Parsed { warnings, .. } => warnings,
            Self::Unparseable { .. } => &[],
        }
    }
}

/// Compact JSON for embedding in the prompt. Non-ASCII stays as-is.
pub fn bindings_to_prompt_json(bindings: &VariableBindings) -> String {
    serde_json::to_string(bindings).unwrap_or_else(|_| "{}".to_string())
}

/// Normalizes a raw model reply and parses it into answer entries.
pub fn parse_reply(raw: &str) -> ParseOutcome {
    parse_answers(&normalize_response_text(raw))
}

/// Literal parse first, strict JSON second.
pub fn parse_answers(normalized: &str) -> ParseOutcome {
    let (stage, value) = match parse_literal(normalized) {
        Ok(value) => (ParseStage::Literal, value),
        Err(literal_err) => match serde_json::from_str::<Value>(normalized) {
            Ok(value) => (ParseStage::Json, value),
            Err(json_err) => {
                return ParseOutcome::Unparseable {
                    literal_error: literal_err.to_string(),
                    json_error: json_err.to_string(),
                }
            }
        },
    };

    let mut warnings = Vec::new();
    let entries = entries_from_value(value, &mut warnings);
    ParseOutcome::Parsed {
        stage,
        entries,
        warnings,
    }
}

/// Coerces a parsed value into entries, defaulting `assign` to false.
///
/// A lone mapping counts as a one-entry list. Every mapping is kept; a
/// missing or null `expr` becomes an empty string and is noted in `warnings`.
/// Elements that are not mappings are skipped and reported in `warnings`.
pub fn entries_from_value(value: Value, warnings: &mut Vec<String>) -> Vec<AnswerEntry> {
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(map) => vec![Value::Object(map)],
        other => {
            warnings.push(format!(
                "expected a list of mappings, got {}",
                value_kind(&other)
            ));
            return Vec::new();
        }
    };

    let mut entries = Vec::new();
    for (idx, row) in rows.into_iter().enumerate() {
        let map = match row {
            Value::Object(map) => map,
            other => {
                warnings.push(format!(
                    "entry {idx} skipped: expected a mapping, got {}",
                    value_kind(&other)
                ));
                continue;
            }
        };
        let entry = entry_from_map(map);
        if entry.expr.is_empty() {
            warnings.push(format!("entry {idx} has no 'expr'"));
        }
        entries.push(entry);
    }
    entries
}

fn entry_from_map(mut map: Map<String, Value>) -> AnswerEntry {
    let expr = match map.remove("expr") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    };
    let result = map.remove("result").unwrap_or(Value::Null);
    let assign = map.get("assign").map(coerce_assign).unwrap_or(false);
    AnswerEntry {
        expr,
        result,
        assign,
    }
}

fn coerce_assign(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1"
        ),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
