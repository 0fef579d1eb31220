//! JSON-schema emission for external consumers: agents validating action
//! payloads and connector configuration tooling.
//!
//! The string patterns are the same regex identities the parsers enforce,
//! so a payload accepted by these schemas parses on the wire.

use serde_json::{Value, json};

use crate::uri::{
    external_uri_examples, regex_knowledge_uri, regex_reference, regex_resource_uri,
    regex_web_url,
};

/// Schema for any reference: a knowledge URI or an external URL.
#[must_use]
pub fn reference_schema() -> Value {
    json!({
        "type": "string",
        "pattern": format!("^{}$", regex_reference()),
        "examples": [
            "https://example.com",
            "https://example.com/mypage.html?queryParam=42#fragment",
            "ndk://jira/issue/PROJ-123",
            "ndk://stub/-/dir/example",
            "ndk://stub/-/dir/example/$body",
            "ndk://stub/-/dir/example/$chunk/01/02",
            "ndk://stub/-/dir/example/$media/figures/image.png",
        ],
    })
}

/// Schema for a bare resource URI.
#[must_use]
pub fn resource_uri_schema() -> Value {
    json!({
        "type": "string",
        "pattern": format!("^{}$", regex_resource_uri()),
        "examples": ["ndk://jira/issue/PROJ-123", "ndk://stub/-/dir/example"],
    })
}

/// Schema for any `ndk://` URI, suffixed or not.
#[must_use]
pub fn knowledge_uri_schema() -> Value {
    json!({
        "type": "string",
        "pattern": format!("^{}$", regex_knowledge_uri()),
        "examples": [
            "ndk://stub/-/dir/example",
            "ndk://stub/-/dir/example/$body",
            "ndk://stub/-/dir/example/$collection",
            "ndk://stub/-/dir/example/$file/main.tex",
            "ndk://stub/-/dir/example/$plain",
        ],
    })
}

/// Schema for an external web URL.
#[must_use]
pub fn external_uri_schema() -> Value {
    json!({
        "type": "string",
        "pattern": format!("^{}$", regex_web_url()),
        "examples": external_uri_examples(),
    })
}

/// Schema for the action wire format: a tagged union on `method`.
#[must_use]
pub fn query_action_schema() -> Value {
    let load_mode = json!({"type": "string", "enum": ["none", "auto", "force"]});
    let observable = json!({
        "type": "string",
        "pattern": r"^\$[a-z]+(?:/[^/]+)*$",
        "examples": ["$body", "$chunk/01/02", "$collection", "$plain"],
    });

    json!({
        "oneOf": [
            {
                "type": "object",
                "properties": {
                    "method": {"const": "resources/load"},
                    "uri": reference_schema(),
                    "expand_depth": {"type": "integer", "minimum": 0},
                    "expand_mode": load_mode,
                    "load_mode": load_mode,
                    "observe": {"type": "array", "items": observable},
                },
                "required": ["method", "uri"],
                "additionalProperties": false,
            },
            {
                "type": "object",
                "properties": {
                    "method": {"const": "resources/observe"},
                    "uri": knowledge_uri_schema(),
                },
                "required": ["method", "uri"],
                "additionalProperties": false,
            },
            {
                "type": "object",
                "properties": {
                    "method": {"const": "resources/attachment"},
                    "uri": reference_schema(),
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "attachment": {
                        "oneOf": [
                            {
                                "type": "object",
                                "properties": {
                                    "type": {"const": "blob"},
                                    "mime_type": {"type": "string"},
                                    "blob": {"type": "string"},
                                },
                                "required": ["type", "mime_type", "blob"],
                                "additionalProperties": false,
                            },
                            {
                                "type": "object",
                                "properties": {
                                    "type": {"const": "plain"},
                                    "mime_type": {"type": "string"},
                                    "text": {"type": "string"},
                                },
                                "required": ["type", "text"],
                                "additionalProperties": false,
                            },
                            {
                                "type": "object",
                                "properties": {
                                    "type": {"const": "url"},
                                    "mime_type": {"type": "string"},
                                    "expiry": {"type": "string", "format": "date-time"},
                                    "download_url": external_uri_schema(),
                                },
                                "required": ["type", "download_url"],
                                "additionalProperties": false,
                            },
                        ],
                    },
                },
                "required": ["method", "uri", "attachment"],
                "additionalProperties": false,
            },
        ],
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_reference_schema_pattern_matches_examples() {
        let schema = reference_schema();
        let pattern = Regex::new(schema["pattern"].as_str().unwrap()).unwrap();
        for example in schema["examples"].as_array().unwrap() {
            assert!(
                pattern.is_match(example.as_str().unwrap()),
                "example '{example}' does not match its own schema"
            );
        }
    }

    #[test]
    fn test_schema_pattern_agrees_with_parser() {
        let schema = resource_uri_schema();
        let pattern = Regex::new(schema["pattern"].as_str().unwrap()).unwrap();

        // Everything the pattern accepts must parse; everything it rejects
        // must fail to parse.
        let cases = [
            ("ndk://jira/issue/PROJ-123", true),
            ("ndk://stub/-/dir/example", true),
            ("ndk://jira/issue", false),
            ("https://example.com", false),
        ];
        for (value, expected) in cases {
            assert_eq!(pattern.is_match(value), expected, "pattern on '{value}'");
            assert_eq!(
                crate::uri::ResourceUri::decode(value).is_ok(),
                expected,
                "parser on '{value}'"
            );
        }
    }

    #[test]
    fn test_action_schema_lists_all_methods() {
        let schema = query_action_schema();
        let methods: Vec<&str> = schema["oneOf"]
            .as_array()
            .unwrap()
            .iter()
            .map(|variant| variant["properties"]["method"]["const"].as_str().unwrap())
            .collect();
        assert_eq!(
            methods,
            vec![
                "resources/load",
                "resources/observe",
                "resources/attachment"
            ]
        );
    }
}
