//! Map-function evaluator
//!
//! Map functions arrive as JavaScript source text and run inside an embedded
//! engine. Compilation is content-addressed: the sha-256 digest of the
//! source names both the compiled function and its scratch file, so
//! re-registering identical text reuses the previous artifact.
//!
//! The `emit` and `log` capabilities are process-wide bindings over
//! thread-local buffers. The protocol is strictly sequential, so one buffer
//! per thread is never shared across overlapping invocations.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

use boa_engine::{
    js_string, Context, JsObject, JsResult, JsString, JsValue, NativeFunction, Source,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

thread_local! {
    /// Scratch emission buffer, cleared before each map invocation.
    static EMISSIONS: RefCell<Vec<(Value, Value)>> = const { RefCell::new(Vec::new()) };
    /// Diagnostic lines queued by map code, drained once per request.
    static LOG_LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Errors raised while compiling or running map functions.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Source text failed to compile or did not evaluate to a function.
    #[error("failed to compile map function: {0}")]
    Compile(String),

    /// The map function (or document conversion) threw.
    #[error("map function failed: {0}")]
    Execution(String),

    /// The normalized source could not be persisted to the scratch file.
    #[error("failed to persist map source: {0}")]
    Scratch(#[from] std::io::Error),
}

struct CompiledMap {
    digest: String,
    func: JsObject,
}

/// Compiles and runs registered map functions over documents.
pub struct Evaluator {
    ctx: Context,
    funcs: Vec<CompiledMap>,
    by_digest: HashMap<String, JsObject>,
    scratch_dir: PathBuf,
}

impl Evaluator {
    /// Create an evaluator with `emit`/`log` installed and scratch files
    /// under the OS temp directory.
    pub fn new() -> Result<Self, EvalError> {
        Self::with_scratch_dir(std::env::temp_dir())
    }

    /// Create an evaluator persisting scratch files under `scratch_dir`.
    pub fn with_scratch_dir(scratch_dir: PathBuf) -> Result<Self, EvalError> {
        let mut ctx = Context::default();
        ctx.register_global_builtin_callable(
            js_string!("emit"),
            2,
            NativeFunction::from_fn_ptr(emit_builtin),
        )
        .map_err(|e| EvalError::Compile(e.to_string()))?;
        ctx.register_global_builtin_callable(
            js_string!("log"),
            1,
            NativeFunction::from_fn_ptr(log_builtin),
        )
        .map_err(|e| EvalError::Compile(e.to_string()))?;

        Ok(Self {
            ctx,
            funcs: Vec::new(),
            by_digest: HashMap::new(),
            scratch_dir,
        })
    }

    /// Register one map function from source text. An identical source
    /// (same digest) reuses the previously compiled function.
    pub fn register(&mut self, source: &str) -> Result<(), EvalError> {
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        if let Some(func) = self.by_digest.get(&digest) {
            debug!(%digest, "reusing compiled map function");
            self.funcs.push(CompiledMap {
                digest,
                func: func.clone(),
            });
            return Ok(());
        }

        let normalized = normalize_source(source);
        let path = self.scratch_dir.join(format!(
            "supercouch-map-{}-{}.js",
            std::process::id(),
            digest
        ));
        // Overwritten, never cleaned up: the file is small and keyed by
        // content hash.
        std::fs::write(&path, &normalized)?;

        let src = Source::from_filepath(&path)?;
        self.ctx
            .eval(src)
            .map_err(|e| EvalError::Compile(e.to_string()))?;
        let global = self.ctx.global_object();
        let bound = global
            .get(JsString::from(MAP_BINDING), &mut self.ctx)
            .map_err(|e| EvalError::Compile(e.to_string()))?;
        let func = bound
            .as_object()
            .filter(|obj| obj.is_callable())
            .cloned()
            .ok_or_else(|| {
                EvalError::Compile("source did not evaluate to a function".to_string())
            })?;

        debug!(%digest, path = %path.display(), "compiled map function");
        self.by_digest.insert(digest.clone(), func.clone());
        self.funcs.push(CompiledMap { digest, func });
        Ok(())
    }

    /// Run every registered function over one document, in registration
    /// order. Returns one emission list per function. Any throw fails the
    /// whole document.
    pub fn map_doc(&mut self, doc: &Value) -> Result<Vec<Vec<(Value, Value)>>, EvalError> {
        let doc_js = JsValue::from_json(doc, &mut self.ctx)
            .map_err(|e| EvalError::Execution(e.to_string()))?;

        let mut results = Vec::with_capacity(self.funcs.len());
        for map in &self.funcs {
            EMISSIONS.with(|buf| buf.borrow_mut().clear());
            map.func
                .call(&JsValue::undefined(), &[doc_js.clone()], &mut self.ctx)
                .map_err(|e| EvalError::Execution(e.to_string()))?;
            results.push(EMISSIONS.with(|buf| buf.borrow_mut().drain(..).collect()));
        }
        Ok(results)
    }

    /// Drop registered functions. The digest cache survives so a re-added
    /// function after `reset` recompiles nothing.
    pub fn reset(&mut self) {
        self.funcs.clear();
        EMISSIONS.with(|buf| buf.borrow_mut().clear());
    }

    /// Number of currently registered functions.
    pub fn fun_count(&self) -> usize {
        self.funcs.len()
    }

    /// Digest of the function registered at `index`.
    pub fn digest_at(&self, index: usize) -> Option<&str> {
        self.funcs.get(index).map(|m| m.digest.as_str())
    }

    /// Drain the diagnostic lines queued by map code since the last drain.
    pub fn drain_logs() -> Vec<String> {
        LOG_LINES.with(|buf| buf.borrow_mut().drain(..).collect())
    }
}

/// `emit(key, value)`: append one record to the scratch buffer.
fn emit_builtin(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let key = normalize_key(json_arg(args.first(), ctx)?);
    let value = json_arg(args.get(1), ctx)?;
    EMISSIONS.with(|buf| buf.borrow_mut().push((key, value)));
    Ok(JsValue::undefined())
}

/// `log(message)`: queue one diagnostic line.
fn log_builtin(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let message = match args.first() {
        None => String::new(),
        Some(v) if v.is_string() => v.to_string(ctx)?.to_std_string_escaped(),
        Some(v) => v.display().to_string(),
    };
    LOG_LINES.with(|buf| buf.borrow_mut().push(message));
    Ok(JsValue::undefined())
}

fn json_arg(arg: Option<&JsValue>, ctx: &mut Context) -> JsResult<Value> {
    match arg {
        None => Ok(Value::Null),
        Some(v) if v.is_undefined() => Ok(Value::Null),
        Some(v) => v.to_json(ctx),
    }
}

/// Emission key normalization: null/undefined stay null, scalars become
/// one-element arrays, arrays (and anything else) pass as-is.
fn normalize_key(key: Value) -> Value {
    match key {
        Value::Null => Value::Null,
        Value::String(_) | Value::Number(_) => Value::Array(vec![key]),
        other => other,
    }
}

/// Global name the normalized source binds its function to.
const MAP_BINDING: &str = "__supercouch_map";

/// Rewrite a leading `function map(` declaration into an anonymous function
/// expression and bind it to a known global name. The assignment form keeps
/// a trailing semicolon or line comment in the source valid.
fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();
    let body = match trimmed.strip_prefix("function map(") {
        Some(rest) => format!("function ({}", rest),
        None => trimmed.to_string(),
    };
    format!("var {} = {}", MAP_BINDING, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> Evaluator {
        Evaluator::new().unwrap()
    }

    #[test]
    fn test_normalize_source_rewrites_named_map() {
        assert_eq!(
            normalize_source("function map(doc) { emit(doc.k, 1); }"),
            "var __supercouch_map = function (doc) { emit(doc.k, 1); }"
        );
        assert_eq!(
            normalize_source("function (doc) { emit(doc.k, 1); };"),
            "var __supercouch_map = function (doc) { emit(doc.k, 1); };"
        );
    }

    #[test]
    fn test_register_with_trailing_semicolon_and_comment() {
        let mut eval = evaluator();
        eval.register("function (doc) { emit(doc.k, 1); }; // added by tooling")
            .unwrap();
        let results = eval.map_doc(&json!({"k": "x"})).unwrap();
        assert_eq!(results[0], vec![(json!(["x"]), json!(1))]);
    }

    #[test]
    fn test_register_with_url_in_source() {
        // "//" inside a string literal is not a comment.
        let mut eval = evaluator();
        eval.register("function (doc) { emit(doc.k, \"http://example\"); } // note")
            .unwrap();
        let results = eval.map_doc(&json!({"k": "x"})).unwrap();
        assert_eq!(results[0], vec![(json!(["x"]), json!("http://example"))]);
    }

    #[test]
    fn test_register_and_map() {
        let mut eval = evaluator();
        eval.register("function (doc) { emit(doc.name, doc.age); }")
            .unwrap();
        let results = eval
            .map_doc(&json!({"name": "ada", "age": 36}))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], vec![(json!(["ada"]), json!(36))]);
    }

    #[test]
    fn test_named_map_declaration() {
        let mut eval = evaluator();
        eval.register("function map(doc) { emit([doc.a, doc.b], null); }")
            .unwrap();
        let results = eval.map_doc(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(results[0], vec![(json!([1, 2]), json!(null))]);
    }

    #[test]
    fn test_key_normalization() {
        let mut eval = evaluator();
        eval.register(
            "function (doc) { emit(null, 1); emit('s', 2); emit(7, 3); emit(['a'], 4); }",
        )
        .unwrap();
        let results = eval.map_doc(&json!({})).unwrap();
        let keys: Vec<&Value> = results[0].iter().map(|(k, _)| k).collect();
        assert_eq!(keys[0], &json!(null));
        assert_eq!(keys[1], &json!(["s"]));
        assert_eq!(keys[2], &json!([7]));
        assert_eq!(keys[3], &json!(["a"]));
    }

    #[test]
    fn test_emit_without_value_defaults_null() {
        let mut eval = evaluator();
        eval.register("function (doc) { emit('only-key'); }").unwrap();
        let results = eval.map_doc(&json!({})).unwrap();
        assert_eq!(results[0], vec![(json!(["only-key"]), json!(null))]);
    }

    #[test]
    fn test_multiple_functions_run_in_order() {
        let mut eval = evaluator();
        eval.register("function (doc) { emit('first', doc.x); }").unwrap();
        eval.register("function (doc) { emit('second', doc.x); }").unwrap();
        let results = eval.map_doc(&json!({"x": 1})).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0][0].0, json!(["first"]));
        assert_eq!(results[1][0].0, json!(["second"]));
    }

    #[test]
    fn test_duplicate_source_shares_compilation() {
        let mut eval = evaluator();
        let src = "function (doc) { emit(doc.k, 1); }";
        eval.register(src).unwrap();
        eval.register(src).unwrap();
        assert_eq!(eval.fun_count(), 2);
        assert_eq!(eval.digest_at(0), eval.digest_at(1));
    }

    #[test]
    fn test_throwing_function_reports_execution_error() {
        let mut eval = evaluator();
        eval.register("function (doc) { throw new Error('boom'); }")
            .unwrap();
        let err = eval.map_doc(&json!({})).unwrap_err();
        assert!(matches!(err, EvalError::Execution(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_bad_source_reports_compile_error() {
        let mut eval = evaluator();
        assert!(matches!(
            eval.register("function (doc { nope"),
            Err(EvalError::Compile(_))
        ));
        assert!(matches!(
            eval.register("42"),
            Err(EvalError::Compile(_))
        ));
    }

    #[test]
    fn test_reset_clears_functions() {
        let mut eval = evaluator();
        eval.register("function (doc) { emit(1, 1); }").unwrap();
        eval.reset();
        assert_eq!(eval.fun_count(), 0);
        assert!(eval.map_doc(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_log_lines_are_queued() {
        let mut eval = evaluator();
        // Drain anything left over from other tests on this thread.
        let _ = Evaluator::drain_logs();
        eval.register("function (doc) { log('saw ' + doc.k); emit(doc.k, 1); }")
            .unwrap();
        eval.map_doc(&json!({"k": "x"})).unwrap();
        assert_eq!(Evaluator::drain_logs(), vec!["saw x".to_string()]);
        assert!(Evaluator::drain_logs().is_empty());
    }

    #[test]
    fn test_scratch_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut eval = Evaluator::with_scratch_dir(dir.path().to_path_buf()).unwrap();
        eval.register("function (doc) { emit(doc.k, 1); }").unwrap();
        let digest = eval.digest_at(0).unwrap().to_string();
        let path = dir
            .path()
            .join(format!("supercouch-map-{}-{}.js", std::process::id(), digest));
        let persisted = std::fs::read_to_string(path).unwrap();
        assert!(persisted.starts_with("var "));
    }
}
