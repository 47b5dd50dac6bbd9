//! Turns raw container output into text a person can read.

use crate::summarize::{SummarizeError, Summarizer};
use regex::Regex;
use std::sync::OnceLock;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant that processes technical logs. \
Rewrite technical logs into a clear, concise user-facing message, removing technical \
artifacts and redundant information.";

const USER_PROMPT_PREAMBLE: &str = "Below are the raw logs from an AI coding assistant. \
Please rewrite these logs as a clear, concise message to a user, focusing on the important \
actions and changes made. Remove any technical artifacts, ANSI escape codes, and redundant \
information. Format the response in a user-friendly way.";

fn ansi_escape_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1B[@-_][0-?]*[ -/]*[@-~]").unwrap())
}

/// Removes ANSI/VT100 escape sequences.
///
/// Runs to a fixpoint: removing one sequence can splice a stray ESC onto the
/// bytes that follow and form a new one.
pub fn strip_ansi_escapes(text: &str) -> String {
    let pattern = ansi_escape_pattern();
    let mut current = text.to_string();
    while pattern.is_match(&current) {
        current = pattern.replace_all(&current, "").into_owned();
    }
    current
}

/// Cuts `text` at the first `marker`, dropping the marker, everything after
/// it, and the whitespace just before it. Returns `text` untouched when the
/// marker is absent.
pub fn truncate_at_marker<'a>(text: &'a str, marker: &str) -> &'a str {
    match text.find(marker) {
        Some(idx) => text[..idx].trim_end(),
        None => text,
    }
}

pub fn render_user_prompt(logs: &str) -> String {
    format!("{USER_PROMPT_PREAMBLE}\n\nRaw logs:\n{logs}\n")
}

pub struct LogSanitizer<S> {
    summarizer: S,
    trailing_marker: String,
}

impl<S: Summarizer> LogSanitizer<S> {
    pub fn new(summarizer: S, trailing_marker: impl Into<String>) -> Self {
        Self {
            summarizer,
            trailing_marker: trailing_marker.into(),
        }
    }

    /// Escape-free text cut at the trailing marker. No network involved.
    pub fn clean(&self, raw: &str) -> String {
        let stripped = strip_ansi_escapes(raw);
        truncate_at_marker(&stripped, &self.trailing_marker).to_string()
    }

    /// Cleans `raw` and asks the summarizer to rewrite it. Never fails: any
    /// summarizer error yields the cleaned text.
    ///
    /// Blank cleaned text is returned as-is without a summarizer call, so a
    /// silent container never costs a completion request.
    pub fn sanitize(&self, raw: &str) -> String {
        let cleaned = self.clean(raw);
        if cleaned.trim().is_empty() {
            return cleaned;
        }
        match self
            .summarizer
            .summarize(SYSTEM_PROMPT, &render_user_prompt(&cleaned))
        {
            Ok(summary) => summary.trim().to_string(),
            Err(SummarizeError::Disabled) => {
                tracing::debug!("Summarizer disabled; returning cleaned logs");
                cleaned
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to summarize container logs; returning cleaned logs");
                cleaned
            }
        }
    }
}
