//! View-server line protocol
//!
//! The host database speaks one JSON array per line on stdin and expects one
//! JSON line back per request. The first array element is the command tag;
//! the rest is command-specific payload. This module parses request lines
//! into [`Command`]s and encodes [`Reply`]s back to wire lines.

use serde_json::{json, Value};
use thiserror::Error;

/// Error name for malformed JSON input lines.
pub const ERR_PARSE: &str = "parse_error";
/// Error name for unknown top-level commands.
pub const ERR_UNSUPPORTED: &str = "unsupported_command";
/// Error name for failures inside map code or the backend write.
pub const ERR_PROCESSING: &str = "processing_failed";
/// Error name for replies that failed to serialize.
pub const ERR_OUTPUT: &str = "output_error";

/// Failure to turn an input line into a [`Command`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line was not valid JSON or not an array with a string tag.
    #[error("{0}")]
    Parse(String),

    /// The tag named a command this server does not speak.
    #[error("{0}")]
    Unsupported(String),
}

/// A parsed request from the host database.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Drop registered functions and replace the engine state object.
    Reset(Option<Value>),
    /// Library registration; acknowledged and ignored.
    AddLib,
    /// Register a map function from source text.
    AddFun(String),
    /// Run every registered map function over one document.
    MapDoc(Value),
    /// Reduce is unsupported; answered with one null per function.
    Reduce { fun_count: usize },
    /// Rereduce is unsupported; answered with one null per function.
    Rereduce { fun_count: usize },
    /// Design-document message; acknowledged, nothing is cached.
    Ddoc,
}

impl Command {
    /// Parse one input line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ProtocolError::Parse(format!("invalid JSON: {}", e)))?;
        let Value::Array(parts) = value else {
            return Err(ProtocolError::Parse("request is not an array".to_string()));
        };
        let Some(tag) = parts.first().and_then(Value::as_str) else {
            return Err(ProtocolError::Parse(
                "request has no string command tag".to_string(),
            ));
        };

        match tag {
            "reset" => Ok(Command::Reset(parts.get(1).cloned())),
            "add_lib" => Ok(Command::AddLib),
            "add_fun" => {
                let Some(source) = parts.get(1).and_then(Value::as_str) else {
                    return Err(ProtocolError::Parse(
                        "add_fun expects a source string".to_string(),
                    ));
                };
                Ok(Command::AddFun(source.to_string()))
            }
            "map_doc" => {
                let Some(doc) = parts.get(1).cloned() else {
                    return Err(ProtocolError::Parse(
                        "map_doc expects a document".to_string(),
                    ));
                };
                Ok(Command::MapDoc(doc))
            }
            "reduce" => Ok(Command::Reduce {
                fun_count: fun_count(&parts),
            }),
            "rereduce" => Ok(Command::Rereduce {
                fun_count: fun_count(&parts),
            }),
            "ddoc" => Ok(Command::Ddoc),
            other => Err(ProtocolError::Unsupported(format!(
                "unsupported command '{}'",
                other
            ))),
        }
    }
}

/// Number of functions in a reduce/rereduce payload.
fn fun_count(parts: &[Value]) -> usize {
    parts
        .get(1)
        .and_then(Value::as_array)
        .map_or(0, |funcs| funcs.len())
}

/// A response line to the host database.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Literal `true` acknowledgment.
    True,
    /// Per-function emission lists for one document.
    MapResults(Vec<Vec<Value>>),
    /// `[true, [null, ...]]`: reduce is unsupported.
    ReduceNulls(usize),
    /// `["error", name, reason]`.
    Error { name: String, reason: String },
    /// `["log", message]` diagnostic line.
    Log(String),
}

impl Reply {
    /// Create an error reply.
    pub fn error(name: &str, reason: impl Into<String>) -> Self {
        Reply::Error {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Reply::True => json!(true),
            Reply::MapResults(results) => json!(results),
            Reply::ReduceNulls(count) => {
                json!([true, vec![Value::Null; *count]])
            }
            Reply::Error { name, reason } => json!(["error", name, reason]),
            Reply::Log(message) => json!(["log", message]),
        }
    }

    /// Encode this reply as one wire line (no trailing newline). A reply
    /// that fails to serialize degrades to an `output_error` line.
    pub fn encode(&self) -> String {
        match serde_json::to_string(&self.to_json()) {
            Ok(line) => line,
            Err(e) => serde_json::to_string(&json!(["error", ERR_OUTPUT, e.to_string()]))
                .unwrap_or_else(|_| {
                    format!("[\"error\",\"{}\",\"unserializable response\"]", ERR_OUTPUT)
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reset() {
        let cmd = Command::parse(r#"["reset", {"timeout": 5000}]"#).unwrap();
        assert_eq!(cmd, Command::Reset(Some(json!({"timeout": 5000}))));
        assert_eq!(Command::parse(r#"["reset"]"#).unwrap(), Command::Reset(None));
    }

    #[test]
    fn test_parse_add_fun() {
        let cmd = Command::parse(r#"["add_fun", "function (doc) {}"]"#).unwrap();
        assert_eq!(cmd, Command::AddFun("function (doc) {}".to_string()));
    }

    #[test]
    fn test_parse_map_doc() {
        let cmd = Command::parse(r#"["map_doc", {"_id": "d1"}]"#).unwrap();
        assert_eq!(cmd, Command::MapDoc(json!({"_id": "d1"})));
    }

    #[test]
    fn test_parse_reduce_counts_functions() {
        let cmd = Command::parse(r#"["reduce", ["f1", "f2"], [[["k"], 1]]]"#).unwrap();
        assert_eq!(cmd, Command::Reduce { fun_count: 2 });
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        assert!(matches!(
            Command::parse("not json"),
            Err(ProtocolError::Parse(_))
        ));
        assert!(matches!(
            Command::parse(r#"{"cmd": "reset"}"#),
            Err(ProtocolError::Parse(_))
        ));
        assert!(matches!(
            Command::parse("[42]"),
            Err(ProtocolError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_command() {
        assert!(matches!(
            Command::parse(r#"["filters", []]"#),
            Err(ProtocolError::Unsupported(_))
        ));
    }

    #[test]
    fn test_encode_true() {
        assert_eq!(Reply::True.encode(), "true");
    }

    #[test]
    fn test_encode_map_results() {
        let reply = Reply::MapResults(vec![vec![json!([["a"], 1])], vec![]]);
        assert_eq!(reply.encode(), r#"[[[["a"],1]],[]]"#);
    }

    #[test]
    fn test_encode_reduce_nulls() {
        assert_eq!(Reply::ReduceNulls(2).encode(), "[true,[null,null]]");
        assert_eq!(Reply::ReduceNulls(0).encode(), "[true,[]]");
    }

    #[test]
    fn test_encode_error() {
        let reply = Reply::error(ERR_UNSUPPORTED, "unsupported command 'shows'");
        assert_eq!(
            reply.encode(),
            r#"["error","unsupported_command","unsupported command 'shows'"]"#
        );
    }

    #[test]
    fn test_encode_log() {
        assert_eq!(Reply::Log("hi".to_string()).encode(), r#"["log","hi"]"#);
    }
}
