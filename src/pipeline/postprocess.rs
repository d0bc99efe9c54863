//! Post-processing: deterministic cleanup of model output.
//!
//! Two things come back from the model that need tidying before they reach
//! a record:
//!
//! 1. **The payload.** Asked for a bare JSON object, models still wrap it in
//!    ` ```json … ``` ` fences or put a sentence in front of it.
//!    [`json_payload`] recovers the object text.
//! 2. **The transcription.** `extracted_text` is Markdown and inherits the
//!    usual VLM quirks: outer fences, CRLF, runs of blank lines, tables
//!    without a separator row, zero-width characters.
//!    [`clean_transcription`] fixes those without touching content.
//!
//! Each rule is a pure `&str → String` pass and is tested on its own.

use once_cell::sync::Lazy;
use regex::Regex;

/// Recover the JSON object text from a raw model response.
///
/// Strips outer code fences, then takes the span from the first `{` to the
/// last `}`. Returns `None` when no such span exists.
pub fn json_payload(raw: &str) -> Option<&str> {
    let body = fenced_body(raw.trim()).unwrap_or_else(|| raw.trim());
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (start < end).then(|| &body[start..=end])
}

/// Clean the Markdown transcription stored in `extracted_text`.
///
/// Rules (applied in order):
/// 1. Strip outer code fences (the prompt forbids them; models add them anyway)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
/// 5. Insert a missing separator row under a table's header row
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 7. Trim leading/trailing blank lines
pub fn clean_transcription(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = fix_broken_tables(&s);
    let s = remove_invisible_chars(&s);
    s.trim_matches('\n').to_string()
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn fenced_body(input: &str) -> Option<&str> {
    RE_OUTER_FENCES
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn strip_code_fences(input: &str) -> String {
    fenced_body(input.trim())
        .unwrap_or(input)
        .to_string()
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 5: Fix tables missing a separator row ───────────────────────────

/// A table is a run of `|…|` lines. If its second line is not a separator,
/// one is inserted with as many columns as the header.
fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());

        let prev_is_row = i > 0 && is_table_row(lines[i - 1]);
        if prev_is_row || !is_table_row(line) || is_separator_row(line) {
            continue;
        }
        let next = lines.get(i + 1).copied().unwrap_or("");
        if is_table_row(next) && !is_separator_row(next) {
            let columns = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(columns)));
        }
    }

    out.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() > 2 && trimmed.starts_with('|') && trimmed.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

// ── Rule 6: Remove invisible Unicode characters ──────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_fences() {
        assert_eq!(json_payload(r#"{"a":1}"#), Some(r#"{"a":1}"#));
    }

    #[test]
    fn payload_inside_json_fence() {
        let raw = "```json\n{\"total\": 2790}\n```";
        assert_eq!(json_payload(raw), Some("{\"total\": 2790}"));
    }

    #[test]
    fn payload_with_leading_prose() {
        let raw = "Here is the data:\n{\"currency\": \"EUR\"}\nThanks.";
        assert_eq!(json_payload(raw), Some("{\"currency\": \"EUR\"}"));
    }

    #[test]
    fn payload_missing() {
        assert_eq!(json_payload(""), None);
        assert_eq!(json_payload("no json here"), None);
        assert_eq!(json_payload("} {"), None);
    }

    #[test]
    fn strips_markdown_fence() {
        assert_eq!(strip_code_fences("```markdown\n# Bill\nTotal\n```"), "# Bill\nTotal");
        assert_eq!(strip_code_fences("```\n# Bill\n```"), "# Bill");
        assert_eq!(strip_code_fences("# Bill"), "# Bill");
    }

    #[test]
    fn line_endings_and_trailing_space() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(trim_trailing_whitespace("a   \nb\t"), "a\nb");
    }

    #[test]
    fn blank_line_runs_collapse() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn table_gets_a_separator_row() {
        let fixed = fix_broken_tables("| Item | Price |\n| Coffee | 3.20 |");
        let lines: Vec<&str> = fixed.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(is_separator_row(lines[1]));
        assert_eq!(lines[1], "| --- | --- |");
    }

    #[test]
    fn well_formed_table_is_unchanged() {
        let input = "| Item | Price |\n| --- | --- |\n| Coffee | 3.20 |\n| Tea | 2.90 |";
        assert_eq!(fix_broken_tables(input), input);
    }

    #[test]
    fn invisible_chars_are_removed() {
        assert_eq!(
            remove_invisible_chars("To\u{200B}tal\u{FEFF}: 27\u{00AD},90"),
            "Total: 27,90"
        );
    }

    #[test]
    fn full_transcription_cleanup() {
        let input = "```markdown\nlogo: ACME\r\n\r\n\r\n\r\n\r\n| Item | Price |\n| Coffee | 3.20 |   \n```";
        let out = clean_transcription(input);
        assert!(out.starts_with("logo: ACME"));
        assert!(!out.contains("\n\n\n\n"));
        assert!(out.contains("| --- | --- |"));
        assert!(!out.ends_with('\n'));
    }
}
