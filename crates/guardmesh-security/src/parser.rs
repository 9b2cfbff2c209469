//! Strict, fail-closed parsing of the guardian model's reply.
//!
//! Anything that is not a JSON object with a strictly boolean `result`
//! field is rejected with a specific tag — the pipeline turns every
//! rejection into a block. One recovery attempt is made for replies that
//! wrap the JSON in prose: the first balanced `{…}` substring is extracted
//! and re-parsed.

use serde_json::Value;

/// A successfully parsed guardian reply.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardianReply {
    /// `true` means the payload is safe.
    pub result: bool,
    /// Accepted only when numeric and within `[0, 1]`.
    pub confidence: Option<f64>,
    /// Non-string members are dropped.
    pub flags: Vec<String>,
}

/// Why a reply was rejected. Each variant maps to a stable tag that ends
/// up in the block reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseRejection {
    Empty,
    InvalidJson,
    NotAnObject,
    MissingResult,
    NonBooleanResult,
}

impl ParseRejection {
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            ParseRejection::Empty => "EMPTY_RESPONSE",
            ParseRejection::InvalidJson => "INVALID_JSON",
            ParseRejection::NotAnObject => "NOT_AN_OBJECT",
            ParseRejection::MissingResult => "MISSING_RESULT",
            ParseRejection::NonBooleanResult => "NON_BOOLEAN_RESULT",
        }
    }
}

impl std::fmt::Display for ParseRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Parse a raw model reply under fail-closed rules.
pub fn parse_guardian_reply(raw: &str) -> Result<GuardianReply, ParseRejection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseRejection::Empty);
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(_) => {
            // Recovery: models sometimes wrap the object in prose or code
            // fences. Extract the first balanced object and retry once.
            let candidate =
                extract_json_object(trimmed).ok_or(ParseRejection::InvalidJson)?;
            serde_json::from_str::<Value>(candidate).map_err(|_| ParseRejection::InvalidJson)?
        }
    };

    let object = value.as_object().ok_or(ParseRejection::NotAnObject)?;
    let result = object.get("result").ok_or(ParseRejection::MissingResult)?;
    let result = result.as_bool().ok_or(ParseRejection::NonBooleanResult)?;

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c));

    let flags = object
        .get("flags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(GuardianReply {
        result,
        confidence,
        flags,
    })
}

/// Find the first balanced `{…}` substring, honouring string literals and
/// escapes so braces inside strings do not confuse the depth count.
#[must_use]
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_allow_reply() {
        let reply =
            parse_guardian_reply(r#"{"result": true, "confidence": 0.93, "flags": []}"#).unwrap();
        assert!(reply.result);
        assert_eq!(reply.confidence, Some(0.93));
        assert!(reply.flags.is_empty());
    }

    #[test]
    fn clean_block_reply() {
        let reply = parse_guardian_reply(
            r#"{"result": false, "confidence": 1.0, "flags": ["command_injection"]}"#,
        )
        .unwrap();
        assert!(!reply.result);
        assert_eq!(reply.flags, vec!["command_injection"]);
    }

    #[test]
    fn empty_and_whitespace_rejected() {
        assert_eq!(parse_guardian_reply(""), Err(ParseRejection::Empty));
        assert_eq!(parse_guardian_reply("  \n "), Err(ParseRejection::Empty));
    }

    #[test]
    fn non_json_rejected() {
        assert_eq!(
            parse_guardian_reply("the payload looks fine to me"),
            Err(ParseRejection::InvalidJson)
        );
    }

    #[test]
    fn non_object_json_rejected() {
        assert_eq!(parse_guardian_reply("[1, 2, 3]"), Err(ParseRejection::NotAnObject));
        assert_eq!(parse_guardian_reply("true"), Err(ParseRejection::NotAnObject));
        assert_eq!(parse_guardian_reply("\"ok\""), Err(ParseRejection::NotAnObject));
    }

    #[test]
    fn missing_result_rejected() {
        assert_eq!(
            parse_guardian_reply(r#"{"confidence": 0.5}"#),
            Err(ParseRejection::MissingResult)
        );
    }

    #[test]
    fn result_must_be_a_boolean_literal() {
        for raw in [
            r#"{"result": "true"}"#,
            r#"{"result": 1}"#,
            r#"{"result": null}"#,
            r#"{"result": [true]}"#,
        ] {
            assert_eq!(
                parse_guardian_reply(raw),
                Err(ParseRejection::NonBooleanResult),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn recovery_extracts_object_from_prose() {
        let raw = "Sure — here is my assessment:\n```json\n{\"result\": false, \"flags\": [\"sqli\"]}\n```";
        let reply = parse_guardian_reply(raw).unwrap();
        assert!(!reply.result);
        assert_eq!(reply.flags, vec!["sqli"]);
    }

    #[test]
    fn recovery_honours_braces_inside_strings() {
        let raw = r#"note: {"result": true, "flags": ["looks like {weird} input"]} end"#;
        let reply = parse_guardian_reply(raw).unwrap();
        assert!(reply.result);
        assert_eq!(reply.flags, vec!["looks like {weird} input"]);
    }

    #[test]
    fn out_of_range_confidence_is_dropped() {
        let reply = parse_guardian_reply(r#"{"result": true, "confidence": 1.7}"#).unwrap();
        assert_eq!(reply.confidence, None);
        let reply = parse_guardian_reply(r#"{"result": true, "confidence": -0.2}"#).unwrap();
        assert_eq!(reply.confidence, None);
        let reply = parse_guardian_reply(r#"{"result": true, "confidence": "high"}"#).unwrap();
        assert_eq!(reply.confidence, None);
    }

    #[test]
    fn confidence_boundaries_are_inclusive() {
        let reply = parse_guardian_reply(r#"{"result": true, "confidence": 0.0}"#).unwrap();
        assert_eq!(reply.confidence, Some(0.0));
        let reply = parse_guardian_reply(r#"{"result": true, "confidence": 1.0}"#).unwrap();
        assert_eq!(reply.confidence, Some(1.0));
    }

    #[test]
    fn non_string_flags_are_dropped() {
        let reply =
            parse_guardian_reply(r#"{"result": false, "flags": ["a", 3, null, "b"]}"#).unwrap();
        assert_eq!(reply.flags, vec!["a", "b"]);
    }

    #[test]
    fn serialized_verdict_roundtrip_preserves_result() {
        // parse(serialize(reply)) keeps the allow/block outcome intact.
        let original = GuardianReply {
            result: false,
            confidence: Some(0.8),
            flags: vec!["injection".to_string()],
        };
        let raw = serde_json::json!({
            "result": original.result,
            "confidence": original.confidence,
            "flags": original.flags,
        })
        .to_string();
        let back = parse_guardian_reply(&raw).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn extract_json_object_finds_first_balanced() {
        assert_eq!(extract_json_object("x {\"a\": {\"b\": 1}} y {\"c\": 2}"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object("no object here"), None);
        assert_eq!(extract_json_object("{unterminated"), None);
    }
}
