//! Splits a two-part completion into a narrative summary and structured findings.
//!
//! The completion is asked to answer as
//!
//! ```text
//! 1) <short summary>
//! 2) { "measurements": [...], "advice": [...] }
//! ```
//!
//! but nothing enforces that layout, so every step here degrades instead of failing.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::models::{Findings, InterpretationReply};

/// Substituted when the completion carries no narrative at all
pub const EMPTY_SUMMARY_PLACEHOLDER: &str =
    "The interpretation service returned no summary for this submission.";

static SECOND_PART_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*2\)").expect("marker pattern is valid"));

static FIRST_PART_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^1\)\s*").expect("label pattern is valid"));

/// Normalize a raw completion text. Pure: the same input always yields the same reply.
pub fn normalize(content: &str) -> InterpretationReply {
    let (summary_part, structured_part) = split_parts(content);

    InterpretationReply {
        summary: summary_or_placeholder(summary_part, content),
        findings: parse_findings(structured_part, content),
    }
}

fn split_parts(content: &str) -> (&str, Option<&str>) {
    match SECOND_PART_MARKER.find(content) {
        Some(marker) => (&content[..marker.start()], Some(&content[marker.end()..])),
        None => (content, None),
    }
}

fn summary_or_placeholder(summary_part: &str, content: &str) -> String {
    let summary = FIRST_PART_LABEL.replace(summary_part, "");
    let summary = summary.trim();
    let summary = if summary.is_empty() {
        content.trim()
    } else {
        summary
    };

    if summary.is_empty() {
        EMPTY_SUMMARY_PLACEHOLDER.to_string()
    } else {
        summary.to_string()
    }
}

fn parse_findings(structured_part: Option<&str>, content: &str) -> Findings {
    let candidate = structured_part.map(str::trim).unwrap_or_default();
    if candidate.is_empty() {
        return Findings::empty();
    }

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Findings::Parsed(map),
        _ => Findings::RawFallback {
            raw: content.to_string(),
        },
    }
}
