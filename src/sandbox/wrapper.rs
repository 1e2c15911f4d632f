//! Entry-point wrapper
//!
//! Turns a validated script into a standalone Python program that runs the
//! script, calls `main()`, and reports through the protocol in
//! [`super::protocol`]. The script is embedded as a string literal and
//! compiled at run time, so its text cannot break out of the wrapper.

use super::protocol::{ERROR_BEGIN, ERROR_END, RESULT_BEGIN, RESULT_END};
use super::validator::ScriptSubmission;

const TEMPLATE: &str = r#"import json as _jr_json
import os as _jr_os
import sys as _jr_sys

_JR_SOURCE = __JR_SOURCE__


def _jr_emit(begin, payload, end):
    for stream in (_jr_sys.stdout, _jr_sys.__stdout__, _jr_sys.stderr):
        try:
            stream.flush()
        except Exception:
            pass
    data = ("\n" + begin + "\n" + payload + "\n" + end + "\n").encode("utf-8")
    while data:
        data = data[_jr_os.write(1, data):]
    _jr_os._exit(0)


def _jr_fail(kind, message):
    _jr_emit(
        "__JR_ERROR_BEGIN__",
        _jr_json.dumps({"type": kind, "message": message}),
        "__JR_ERROR_END__",
    )


def _jr_describe(exc):
    try:
        return str(exc)
    except Exception:
        return repr(type(exc))


_jr_ns = {"__name__": "__sandbox__", "__builtins__": __builtins__}
try:
    exec(compile(_JR_SOURCE, "<script>", "exec", dont_inherit=True), _jr_ns)
    _jr_main = _jr_ns.get("main")
    if not callable(_jr_main):
        raise NameError("No main() function found in script")
    _jr_result = _jr_main()
except BaseException as _jr_exc:
    _jr_fail(type(_jr_exc).__name__, _jr_describe(_jr_exc))

try:
    _jr_payload = _jr_json.dumps(_jr_result, allow_nan=False)
except BaseException as _jr_exc:
    _jr_fail(
        "SerializationError",
        "main() returned a value that is not JSON serializable: " + _jr_describe(_jr_exc),
    )

_jr_emit("__JR_RESULT_BEGIN__", _jr_payload, "__JR_RESULT_END__")
"#;

/// Self-contained program text derived from one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedProgram {
    text: String,
}

impl WrappedProgram {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Wrap a submission; byte-identical output for identical input
pub fn wrap(submission: &ScriptSubmission) -> WrappedProgram {
    // A JSON string literal is also a valid Python string literal
    let literal = serde_json::Value::String(submission.source().to_string()).to_string();

    let text = TEMPLATE
        .replace("__JR_RESULT_BEGIN__", RESULT_BEGIN)
        .replace("__JR_RESULT_END__", RESULT_END)
        .replace("__JR_ERROR_BEGIN__", ERROR_BEGIN)
        .replace("__JR_ERROR_END__", ERROR_END)
        .replace("__JR_SOURCE__", &literal);

    WrappedProgram { text }
}
