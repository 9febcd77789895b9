//! Command dispatch
//!
//! Owns the engine state (registered functions, host state object, the
//! sorted-set store handle) and turns each parsed [`Command`] into replies.
//! Emissions tagged with the sorted-set marker are collected into one batch
//! per document and committed before the document's reply is produced.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::sset::SSetStore;
use crate::types::{Keep, SSetOp, SSET_MARKER};

use super::evaluator::Evaluator;
use super::protocol::{Command, ProtocolError, Reply, ERR_PARSE, ERR_PROCESSING, ERR_UNSUPPORTED};

/// The query-server engine: one per process, lifetime equal to the process.
pub struct Engine {
    evaluator: Evaluator,
    store: Arc<dyn SSetStore>,
    /// Pass diverted emissions through as normal view rows as well.
    emit_sset: bool,
    /// State object from the last `reset`, replaced wholesale each time.
    state: Option<Value>,
}

impl Engine {
    pub fn new(store: Arc<dyn SSetStore>, emit_sset: bool) -> Result<Self, super::evaluator::EvalError> {
        Ok(Self {
            evaluator: Evaluator::new()?,
            store,
            emit_sset,
            state: None,
        })
    }

    /// Handle one input line. Returns the diagnostic `["log", ...]` replies
    /// queued during processing followed by exactly one terminal reply.
    pub async fn handle_line(&mut self, line: &str) -> Vec<Reply> {
        let reply = match Command::parse(line) {
            Ok(command) => self.dispatch(command).await,
            Err(ProtocolError::Parse(msg)) => {
                warn!(%msg, "discarding unparseable request line");
                Reply::error(ERR_PARSE, msg)
            }
            Err(ProtocolError::Unsupported(msg)) => Reply::error(ERR_UNSUPPORTED, msg),
        };

        // Map-code log lines go to stdout as ["log", ...] and to the
        // configured sinks.
        let mut out: Vec<Reply> = Evaluator::drain_logs()
            .into_iter()
            .map(|line| {
                info!(line = %line, "map function log");
                Reply::Log(line)
            })
            .collect();
        out.push(reply);
        out
    }

    async fn dispatch(&mut self, command: Command) -> Reply {
        match command {
            Command::Reset(state) => {
                debug!("reset: dropping registered functions");
                self.evaluator.reset();
                self.state = state;
                Reply::True
            }
            Command::AddLib => Reply::True,
            Command::AddFun(source) => match self.evaluator.register(&source) {
                Ok(()) => Reply::True,
                Err(e) => Reply::error(ERR_PROCESSING, e.to_string()),
            },
            Command::MapDoc(doc) => self.map_doc(doc).await,
            Command::Reduce { fun_count } | Command::Rereduce { fun_count } => {
                Reply::ReduceNulls(fun_count)
            }
            Command::Ddoc => Reply::True,
        }
    }

    /// Run one document through every registered function, divert tagged
    /// emissions, commit them as one batch, and shape the view rows.
    async fn map_doc(&mut self, doc: Value) -> Reply {
        let per_function = match self.evaluator.map_doc(&doc) {
            Ok(results) => results,
            Err(e) => return Reply::error(ERR_PROCESSING, e.to_string()),
        };

        let mut ops: Vec<SSetOp> = Vec::new();
        let mut view_results: Vec<Vec<Value>> = Vec::with_capacity(per_function.len());
        for emissions in per_function {
            let mut rows = Vec::new();
            for (key, value) in emissions {
                match classify_emission(&key, &value) {
                    Ok(Some(op)) => {
                        ops.push(op);
                        if self.emit_sset {
                            rows.push(json!([key, value]));
                        }
                    }
                    Ok(None) => rows.push(json!([key, value])),
                    Err(msg) => return Reply::error(ERR_PROCESSING, msg),
                }
            }
            view_results.push(rows);
        }

        // The reply is held back until the whole batch commits; a failed
        // commit fails the document.
        if !ops.is_empty() {
            debug!(ops = ops.len(), "committing sorted-set batch");
            if let Err(e) = self.store.process(ops).await {
                return Reply::error(ERR_PROCESSING, e.to_string());
            }
        }

        Reply::MapResults(view_results)
    }

    /// State object from the last `reset`.
    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }
}

/// Decide what one emission is.
///
/// `Ok(Some(op))`: canonical sorted-set emission, diverted.
/// `Ok(None)`: normal emission, passed through unchanged (including keys
/// that carry the marker but not the canonical shape).
/// `Err(msg)`: canonical emission with an unrecognized `keep`; the whole
/// document batch fails.
pub fn classify_emission(key: &Value, value: &Value) -> Result<Option<SSetOp>, String> {
    let Value::Array(parts) = key else {
        return Ok(None);
    };
    if parts.first().and_then(Value::as_str) != Some(SSET_MARKER) {
        return Ok(None);
    }
    // Marker + database + at least one id segment.
    if parts.len() < 3 {
        return Ok(None);
    }
    let mut segments = Vec::with_capacity(parts.len() - 1);
    for part in &parts[1..] {
        let Some(segment) = part.as_str() else {
            return Ok(None);
        };
        segments.push(segment.to_string());
    }

    let Value::Object(fields) = value else {
        return Ok(None);
    };
    let Some(score) = fields.get("score").and_then(Value::as_f64) else {
        return Ok(None);
    };
    let Some(payload) = fields.get("value") else {
        return Ok(None);
    };
    let keep = match fields.get("keep") {
        None => Keep::AllValues,
        Some(Value::String(s)) => match Keep::parse(s) {
            Some(keep) => keep,
            None => return Err(format!("unrecognized keep '{}'", s)),
        },
        Some(_) => return Ok(None),
    };

    let database = segments.remove(0);
    Ok(Some(SSetOp {
        database,
        id_path: segments,
        score,
        value: payload.clone(),
        keep,
    }))
}
