use baton_core::invoke::{InvocationFailure, InvocationOutput, InvocationResult};
use serde_json::Value;

/// Keys a backend may use for its answer text, in lookup order.
const TEXT_KEYS: [&str; 3] = ["response", "result", "text"];

/// Turn a backend's stdout into an [`InvocationOutput`].
///
/// When stdout is a JSON object the answer text, `usage.input_tokens`,
/// `usage.output_tokens` and `session_id` are taken from it. Anything else is
/// plain text with no reported counts. Blank text is `EmptyOutput`.
pub fn parse_response(stdout: &str) -> InvocationResult {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(InvocationFailure::EmptyOutput);
    }

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) else {
        return Ok(InvocationOutput::text(trimmed));
    };

    let text = TEXT_KEYS
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| trimmed.to_string());
    if text.trim().is_empty() {
        return Err(InvocationFailure::EmptyOutput);
    }

    let usage = map.get("usage");
    let count = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64);
    Ok(InvocationOutput {
        text,
        input_tokens: count("input_tokens"),
        output_tokens: count("output_tokens"),
        session_id: map
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let out = parse_response("  hello world\n").unwrap();
        assert_eq!(out.text, "hello world");
        assert_eq!(out.input_tokens, None);
    }

    #[test]
    fn json_with_usage() {
        let out = parse_response(
            r#"{"result":"done","session_id":"s-1","usage":{"input_tokens":120,"output_tokens":40}}"#,
        )
        .unwrap();
        assert_eq!(out.text, "done");
        assert_eq!(out.input_tokens, Some(120));
        assert_eq!(out.output_tokens, Some(40));
        assert_eq!(out.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn response_key_wins_over_result() {
        let out = parse_response(r#"{"response":"gemini says","result":"other"}"#).unwrap();
        assert_eq!(out.text, "gemini says");
    }

    #[test]
    fn blank_output_is_empty() {
        assert_eq!(parse_response(" \n"), Err(InvocationFailure::EmptyOutput));
        assert_eq!(
            parse_response(r#"{"result":""}"#),
            Err(InvocationFailure::EmptyOutput)
        );
    }

    #[test]
    fn json_array_is_plain_text() {
        let out = parse_response("[1, 2]").unwrap();
        assert_eq!(out.text, "[1, 2]");
    }
}
