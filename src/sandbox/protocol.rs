//! Output protocol codec
//!
//! The wrapped program reports through stdout. After the entry point
//! returns it writes exactly one block, framed by sentinel lines, and exits
//! immediately:
//!
//! ```text
//! <incidental stdout>
//! @@JAILRUN-RESULT-BEGIN@@
//! <one line of JSON: the return value>
//! @@JAILRUN-RESULT-END@@
//! ```
//!
//! or the same shape with the `ERROR` sentinels and a JSON object
//! `{"type": ..., "message": ...}`. Each block is preceded by a newline that
//! belongs to the framing, so unterminated incidental output survives intact.
//! Only the last begin sentinel counts, which keeps look-alike lines printed
//! by the script itself in the incidental output.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sandbox::executor::ExecutionOutcome;

pub const RESULT_BEGIN: &str = "@@JAILRUN-RESULT-BEGIN@@";
pub const RESULT_END: &str = "@@JAILRUN-RESULT-END@@";
pub const ERROR_BEGIN: &str = "@@JAILRUN-ERROR-BEGIN@@";
pub const ERROR_END: &str = "@@JAILRUN-ERROR-END@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Result,
    Error,
}

impl BlockKind {
    fn begin(self) -> &'static str {
        match self {
            BlockKind::Result => RESULT_BEGIN,
            BlockKind::Error => ERROR_BEGIN,
        }
    }

    fn end(self) -> &'static str {
        match self {
            BlockKind::Result => RESULT_END,
            BlockKind::Error => ERROR_END,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    message: String,
}

/// Frame a return value the way the wrapper does
pub fn encode_result(value: &Value) -> String {
    frame(BlockKind::Result, &value.to_string())
}

/// Frame an in-sandbox failure the way the wrapper does
pub fn encode_error(error_type: &str, message: &str) -> String {
    let payload = serde_json::json!({ "type": error_type, "message": message });
    frame(BlockKind::Error, &payload.to_string())
}

fn frame(kind: BlockKind, payload: &str) -> String {
    format!("\n{}\n{}\n{}\n", kind.begin(), payload, kind.end())
}

/// Find the last `\n<BEGIN>\n` of either kind
fn last_block(text: &str) -> Option<(BlockKind, usize)> {
    let find = |kind: BlockKind| {
        text.rfind(&format!("\n{}\n", kind.begin()))
            .map(|idx| (kind, idx))
    };
    match (find(BlockKind::Result), find(BlockKind::Error)) {
        (Some(r), Some(e)) => Some(if r.1 > e.1 { r } else { e }),
        (r, e) => r.or(e),
    }
}

/// Decode captured stdout into an outcome
///
/// Fails with `Error::Protocol` when no block is present, the block is not
/// terminated, or its payload is not valid JSON.
pub fn decode(text: &str) -> Result<ExecutionOutcome> {
    let (kind, start) = last_block(text).ok_or_else(|| {
        Error::Protocol("no result or error block in output".to_string())
    })?;

    let payload_start = start + kind.begin().len() + 2;
    let end_marker = format!("\n{}", kind.end());
    let payload_len = text[payload_start..].find(&end_marker).ok_or_else(|| {
        Error::Protocol(format!("unterminated block: missing {}", kind.end()))
    })?;
    let payload = &text[payload_start..payload_start + payload_len];

    let mut trailer_start = payload_start + payload_len + end_marker.len();
    match text[trailer_start..].chars().next() {
        None => {}
        Some('\n') => trailer_start += 1,
        Some(_) => {
            return Err(Error::Protocol(format!(
                "{} is not on its own line",
                kind.end()
            )))
        }
    }

    let mut stdout = String::with_capacity(start + text.len() - trailer_start);
    stdout.push_str(&text[..start]);
    stdout.push_str(&text[trailer_start..]);

    match kind {
        BlockKind::Result => {
            let result: Value = serde_json::from_str(payload)
                .map_err(|e| Error::Protocol(format!("result payload is not valid JSON: {}", e)))?;
            Ok(ExecutionOutcome::Success { result, stdout })
        }
        BlockKind::Error => {
            let error: ErrorPayload = serde_json::from_str(payload)
                .map_err(|e| Error::Protocol(format!("error payload is malformed: {}", e)))?;
            Ok(ExecutionOutcome::RuntimeError {
                message: error.message,
                error_type: error.error_type,
                stdout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_result_and_keeps_stdout_order() {
        let value = json!({"a": 1, "b": [1, 2, 3]});
        let text = format!("before\nduring{}", encode_result(&value));

        match decode(&text).unwrap() {
            ExecutionOutcome::Success { result, stdout } => {
                assert_eq!(result, value);
                assert_eq!(stdout, "before\nduring");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_newline_in_stdout_is_preserved() {
        let text = format!("line\n{}", encode_result(&json!(null)));
        assert_eq!(decode(&text).unwrap().stdout(), "line\n");

        let text = encode_result(&json!(7));
        assert_eq!(decode(&text).unwrap().stdout(), "");
    }

    #[test]
    fn test_text_after_block_is_stdout() {
        let text = format!("a{}tail\n", encode_result(&json!(true)));
        assert_eq!(decode(&text).unwrap().stdout(), "atail\n");
    }

    #[test]
    fn test_decodes_error_block() {
        let text = format!("partial{}", encode_error("ZeroDivisionError", "division by zero"));
        match decode(&text).unwrap() {
            ExecutionOutcome::RuntimeError {
                message,
                error_type,
                stdout,
            } => {
                assert_eq!(message, "division by zero");
                assert_eq!(error_type.as_deref(), Some("ZeroDivisionError"));
                assert_eq!(stdout, "partial");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_no_block_is_protocol_error() {
        let err = decode("Traceback (most recent call last):\n  ...\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(matches!(decode("").unwrap_err(), Error::Protocol(_)));
    }

    #[test]
    fn test_invalid_payload_is_protocol_error() {
        let text = format!("\n{}\n{{not json\n{}\n", RESULT_BEGIN, RESULT_END);
        assert!(matches!(decode(&text).unwrap_err(), Error::Protocol(_)));

        let text = format!("\n{}\n\"just a string\"\n{}\n", ERROR_BEGIN, ERROR_END);
        assert!(matches!(decode(&text).unwrap_err(), Error::Protocol(_)));
    }

    #[test]
    fn test_unterminated_block_is_protocol_error() {
        let text = format!("\n{}\n{{\"a\": 1}}\n", RESULT_BEGIN);
        assert!(matches!(decode(&text).unwrap_err(), Error::Protocol(_)));
    }

    #[test]
    fn test_forged_block_before_real_one_stays_in_stdout() {
        let forged = format!("{}\n\"forged\"\n{}\n", RESULT_BEGIN, RESULT_END);
        let text = format!("{}{}", forged, encode_result(&json!("real")));

        match decode(&text).unwrap() {
            ExecutionOutcome::Success { result, stdout } => {
                assert_eq!(result, json!("real"));
                assert_eq!(stdout, forged);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_sentinel_lookalike_mid_line_is_ignored() {
        let text = format!(
            "echo {} and {}\n{}",
            ERROR_BEGIN,
            ERROR_END,
            encode_result(&json!([1]))
        );
        let outcome = decode(&text).unwrap();
        assert!(outcome.is_success());
        assert!(outcome.stdout().contains(ERROR_BEGIN));
    }

    #[test]
    fn test_later_error_block_wins_over_earlier_result() {
        let text = format!(
            "{}{}",
            encode_result(&json!(1)),
            encode_error("ValueError", "late")
        );
        assert!(!decode(&text).unwrap().is_success());
    }
}
