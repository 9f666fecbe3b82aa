use serde::{Deserialize, Serialize};

/// Token counts reported by the agent for one turn. The agent's stream
/// names cache fields with an `_input` infix; both spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, alias = "cache_read_input_tokens")]
    pub cache_read_tokens: u64,
    #[serde(default, alias = "cache_creation_input_tokens")]
    pub cache_creation_tokens: u64,
}

/// The stream's result record: the last (and authoritative) message of a
/// successful agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: AgentUsage,
}

impl AgentResult {
    pub fn is_result_record(&self) -> bool {
        self.kind == "result"
    }
}

/// Decode the agent's stdout. First try the whole text as a single object;
/// failing that, scan backward line by line for the last syntactically
/// valid object, preferring one tagged `"type": "result"` when both forms
/// are present.
pub fn parse_stdout(stdout: &str) -> Option<AgentResult> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(result) = serde_json::from_str::<AgentResult>(trimmed) {
        return Some(result);
    }

    let mut last_object: Option<AgentResult> = None;
    for line in trimmed.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let Ok(result) = serde_json::from_value::<AgentResult>(value) else {
            continue;
        };
        if result.is_result_record() {
            return Some(result);
        }
        if last_object.is_none() {
            last_object = Some(result);
        }
    }
    last_object
}

/// Scan raw stdout for a `session_id` carried by any stream message, so a
/// failed run can still be resumed later.
pub fn salvage_session_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if let Some(session) = value.get("session_id").and_then(|v| v.as_str())
            && !session.is_empty()
        {
            return Some(session.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_stdout_single_object() {
        let out = r#"{"type":"result","result":"done","session_id":"s1","stop_reason":"end_turn","is_error":false,"total_cost_usd":0.01,"usage":{"input_tokens":3,"output_tokens":7}}"#;
        let parsed = parse_stdout(out).unwrap();
        assert_eq!(parsed.result, "done");
        assert_eq!(parsed.session_id, "s1");
        assert_eq!(parsed.stop_reason, "end_turn");
        assert_eq!(parsed.usage.output_tokens, 7);
    }

    #[test]
    fn test_stream_takes_trailing_result_record() {
        let out = concat!(
            "{\"type\":\"system\",\"session_id\":\"s2\"}\n",
            "{\"type\":\"assistant\",\"message\":\"working\"}\n",
            "{\"type\":\"result\",\"result\":\"all good\",\"session_id\":\"s2\",\"stop_reason\":\"end_turn\"}\n",
        );
        let parsed = parse_stdout(out).unwrap();
        assert!(parsed.is_result_record());
        assert_eq!(parsed.result, "all good");
    }

    #[test]
    fn test_result_record_preferred_over_later_objects() {
        let out = concat!(
            "{\"type\":\"result\",\"result\":\"the answer\",\"stop_reason\":\"end_turn\"}\n",
            "{\"type\":\"trailer\",\"note\":\"written after\"}\n",
        );
        let parsed = parse_stdout(out).unwrap();
        assert_eq!(parsed.result, "the answer");
    }

    #[test]
    fn test_last_valid_object_when_no_result_record() {
        let out = concat!(
            "not json at all\n",
            "{\"type\":\"assistant\",\"session_id\":\"s3\"}\n",
            "{broken\n",
        );
        let parsed = parse_stdout(out).unwrap();
        assert_eq!(parsed.kind, "assistant");
        assert_eq!(parsed.session_id, "s3");
    }

    #[test]
    fn test_unparseable_output_is_none() {
        assert!(parse_stdout("").is_none());
        assert!(parse_stdout("plain text\nmore text").is_none());
    }

    #[test]
    fn test_alias_cache_fields() {
        let out = r#"{"type":"result","usage":{"cache_read_input_tokens":11,"cache_creation_input_tokens":4}}"#;
        let parsed = parse_stdout(out).unwrap();
        assert_eq!(parsed.usage.cache_read_tokens, 11);
        assert_eq!(parsed.usage.cache_creation_tokens, 4);
    }

    #[test]
    fn test_salvage_session_id_from_early_message() {
        let out = concat!(
            "{\"type\":\"system\",\"session_id\":\"sess-early\"}\n",
            "garbage that never parsed\n",
        );
        assert_eq!(salvage_session_id(out).as_deref(), Some("sess-early"));
        assert!(salvage_session_id("no json here").is_none());
    }
}
