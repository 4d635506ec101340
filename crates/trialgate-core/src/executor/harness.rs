//! Result envelope protocol between the engine and the interpreter harness.
//!
//! The harness runs inside a fresh interpreter process. It loads the candidate
//! as an isolated module, checks the entrypoint, invokes it and writes exactly
//! one JSON envelope to a result file. Candidate output on stdout/stderr never
//! touches that file.
//!
//! Non-finite floats are written as `{"$nonfinite": "nan" | "inf" | "-inf"}`
//! because JSON has no literal for them.

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{ErrorKind, ExecutorOutcome};

use super::error::{ExecutorError, ExecutorResult};

/// Default harness for Python candidates.
///
/// argv: `<candidate> <entrypoint> <arity> <result_path> <arg_path>`
pub const PYTHON_HARNESS: &str = r#"import importlib.util
import inspect
import json
import math
import sys


def _encode(obj):
    if isinstance(obj, bool) or obj is None or isinstance(obj, (int, str)):
        return obj
    if isinstance(obj, float):
        if math.isnan(obj):
            return {"$nonfinite": "nan"}
        if math.isinf(obj):
            return {"$nonfinite": "inf" if obj > 0 else "-inf"}
        return obj
    if isinstance(obj, dict):
        return {str(k): _encode(v) for k, v in obj.items()}
    if isinstance(obj, (list, tuple)):
        return [_encode(v) for v in obj]
    if hasattr(obj, "tolist"):
        return _encode(obj.tolist())
    if hasattr(obj, "item"):
        return _encode(obj.item())
    if hasattr(obj, "__iter__"):
        return [_encode(v) for v in obj]
    return repr(obj)


def _write(path, payload):
    with open(path, "w", encoding="utf-8") as fh:
        json.dump(payload, fh, allow_nan=False)


def _raised(path, phase, exc):
    message = str(exc) or repr(exc)
    _write(path, {"status": "raised", "phase": phase,
                  "exception": type(exc).__name__, "message": message})


def main():
    candidate, entrypoint, arity, result_path, arg_path = sys.argv[1:6]
    arity = int(arity)
    with open(arg_path, encoding="utf-8") as fh:
        arg = json.load(fh)
    sys.stdout = sys.stderr

    try:
        spec = importlib.util.spec_from_file_location("candidate", candidate)
        module = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(module)
    except BaseException as exc:
        _raised(result_path, "load", exc)
        return

    func = getattr(module, entrypoint, None)
    if func is None or not callable(func):
        _write(result_path, {"status": "entrypoint_missing"})
        return

    try:
        params = list(inspect.signature(func).parameters.values())
    except (TypeError, ValueError):
        params = None
    if params is not None:
        positional = [p for p in params
                      if p.kind in (p.POSITIONAL_ONLY, p.POSITIONAL_OR_KEYWORD)]
        required = [p for p in positional if p.default is p.empty]
        varargs = any(p.kind == p.VAR_POSITIONAL for p in params)
        if not (len(required) <= arity and (varargs or arity <= len(positional))):
            _write(result_path, {"status": "signature_mismatch",
                                 "expected": arity, "actual": len(positional)})
            return

    args = list(arg) if arity != 1 and isinstance(arg, list) else [arg]
    try:
        value = func(*args)
    except BaseException as exc:
        _raised(result_path, "call", exc)
        return

    try:
        _write(result_path, {"status": "returned", "value": _encode(value)})
    except BaseException as exc:
        _raised(result_path, "call", exc)


main()
"#;

/// Phase in which the harness observed an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Load,
    Call,
}

/// One envelope as written by the harness.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Envelope {
    Returned {
        value: Value,
    },
    Raised {
        phase: Phase,
        exception: String,
        message: String,
    },
    EntrypointMissing,
    SignatureMismatch {
        expected: usize,
        actual: usize,
    },
}

impl Envelope {
    pub fn parse(raw: &str) -> ExecutorResult<Self> {
        serde_json::from_str(raw).map_err(|e| ExecutorError::Envelope(e.to_string()))
    }

    pub fn into_outcome(self, entrypoint: &str) -> ExecutorOutcome {
        match self {
            Self::Returned { value } => ExecutorOutcome::Returned { value },
            Self::Raised {
                phase: Phase::Load,
                exception,
                message,
            } => ExecutorOutcome::RaisedError {
                kind: ErrorKind::Load,
                message: format!("{exception}: {message}"),
            },
            Self::Raised {
                phase: Phase::Call,
                exception,
                message,
            } => ExecutorOutcome::RaisedError {
                kind: ErrorKind::from_exception_name(&exception),
                message,
            },
            Self::EntrypointMissing => ExecutorOutcome::EntrypointMissing {
                entrypoint: entrypoint.to_string(),
            },
            Self::SignatureMismatch { expected, actual } => {
                ExecutorOutcome::SignatureMismatch { expected, actual }
            }
        }
    }
}
