//! Parsing helpers for model responses.
//!
//! Pure functions: locating ```` ```repl ```` blocks, reading the structured
//! `FINAL_ANSWER:` format and truncating sandbox output before it is fed back.

use crate::query::result::Confidence;

/// Marker that ends a query from prose
pub const FINAL_ANSWER_MARKER: &str = "FINAL_ANSWER:";

/// Longest observation fed back to the model, in characters
pub const MAX_OUTPUT_CHARS: usize = 20_000;

const REPL_OPEN: &str = "```repl";
const REPL_CLOSE: &str = "\n```";

const ANSWER_LABEL: &str = "final_answer:";
const EVIDENCE_LABEL: &str = "source_evidence:";
const CONFIDENCE_LABEL: &str = "confidence:";
const VERIFICATION_LABEL: &str = "verification_method:";

/// Structured fields of a final answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnswer {
    pub answer: String,
    pub evidence: Option<String>,
    pub confidence: Confidence,
    pub verification: Option<String>,
}

/// Whether a response ends the query with a prose answer.
pub fn has_final_answer(response: &str) -> bool {
    response.contains(FINAL_ANSWER_MARKER)
}

/// Extract the bodies of all ```` ```repl ```` blocks, in order.
///
/// The opening fence must be followed by optional whitespace and a newline;
/// the body ends at the first following line that starts with ```` ``` ````.
pub fn extract_repl_blocks(response: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(found) = response[cursor..].find(REPL_OPEN) {
        let after_open = cursor + found + REPL_OPEN.len();
        let rest = &response[after_open..];
        let whitespace = &rest[..rest.len() - rest.trim_start().len()];

        // The body may start after any newline in the whitespace run; prefer the last
        let body = whitespace.match_indices('\n').rev().find_map(|(newline, _)| {
            let start = after_open + newline + 1;
            response[start..].find(REPL_CLOSE).map(|end| (start, start + end))
        });

        match body {
            Some((start, end)) => {
                blocks.push(response[start..end].to_string());
                cursor = end + REPL_CLOSE.len();
            }
            None => cursor = after_open,
        }
    }

    blocks
}

/// Parse the `FINAL_ANSWER:` / `SOURCE_EVIDENCE:` / `CONFIDENCE:` /
/// `VERIFICATION_METHOD:` format. Labels match case-insensitively.
///
/// When no answer can be isolated the whole response is the answer.
pub fn parse_final_answer(response: &str) -> ParsedAnswer {
    let lower = response.to_ascii_lowercase();

    let answer = labelled(response, &lower, ANSWER_LABEL, &[EVIDENCE_LABEL, CONFIDENCE_LABEL, VERIFICATION_LABEL])
        .unwrap_or_else(|| response.to_string());
    let evidence = labelled(response, &lower, EVIDENCE_LABEL, &[CONFIDENCE_LABEL, VERIFICATION_LABEL]);
    let verification = labelled(response, &lower, VERIFICATION_LABEL, &[]);

    let confidence = lower
        .find(CONFIDENCE_LABEL)
        .map(|pos| {
            let word: String = response[pos + CONFIDENCE_LABEL.len()..]
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            Confidence::parse(&word)
        })
        .unwrap_or(Confidence::Unknown);

    ParsedAnswer {
        answer,
        evidence,
        confidence,
        verification,
    }
}

/// Text after `label` up to the first of `terminators`, trimmed. `None` if absent or blank.
fn labelled(response: &str, lower: &str, label: &str, terminators: &[&str]) -> Option<String> {
    let start = lower.find(label)? + label.len();
    let end = terminators
        .iter()
        .filter_map(|t| lower[start..].find(t).map(|pos| start + pos))
        .min()
        .unwrap_or(response.len());

    let text = response[start..end].trim();
    if text.is_empty() { None } else { Some(text.to_string()) }
}

/// Cap `output` at [`MAX_OUTPUT_CHARS`] characters, appending a marker with the full size.
pub fn truncate_output(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }

    let mut truncated: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
    truncated.push_str(&format!(
        "\n... [OUTPUT TRUNCATED: {} chars total, showing first {}]",
        with_thousands(total),
        with_thousands(MAX_OUTPUT_CHARS)
    ));
    truncated
}

/// Keep at most `limit` characters of `text`.
pub fn clip_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

fn with_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_single_block() {
        let response = "Let me look.\n```repl\nprint(len(context))\n```\nDone.";
        assert_eq!(extract_repl_blocks(response), vec!["print(len(context))"]);
    }

    #[test]
    fn test_extract_multiple_blocks() {
        let response = "```repl\na = 1\n```\ntext\n```repl  \nb = 2\nc = 3\n```";
        assert_eq!(extract_repl_blocks(response), vec!["a = 1", "b = 2\nc = 3"]);
    }

    #[test]
    fn test_extract_ignores_other_fences() {
        let response = "```python\nprint(1)\n```\n```repl print(2)\n```";
        assert!(extract_repl_blocks(response).is_empty());
    }

    #[test]
    fn test_extract_unterminated_block() {
        assert!(extract_repl_blocks("```repl\nprint(1)").is_empty());
    }

    #[test]
    fn test_extract_empty_block() {
        assert_eq!(extract_repl_blocks("```repl\n\n```"), vec![""]);
    }

    #[test]
    fn test_has_final_answer() {
        assert!(has_final_answer("FINAL_ANSWER: 42"));
        assert!(!has_final_answer("final answer is 42"));
    }

    #[test]
    fn test_parse_full_format() {
        let response = "FINAL_ANSWER: $1.8M\n\
                        SOURCE_EVIDENCE: \"Q3 2024 revenue reached $1.8M.\"\n\
                        CONFIDENCE: high\n\
                        VERIFICATION_METHOD: grep over the document";
        let parsed = parse_final_answer(response);
        assert_eq!(parsed.answer, "$1.8M");
        assert_eq!(parsed.evidence.as_deref(), Some("\"Q3 2024 revenue reached $1.8M.\""));
        assert_eq!(parsed.confidence, Confidence::High);
        assert_eq!(parsed.verification.as_deref(), Some("grep over the document"));
    }

    #[test]
    fn test_parse_answer_only() {
        let parsed = parse_final_answer("Thinking done.\nFINAL_ANSWER: 17 contracts");
        assert_eq!(parsed.answer, "17 contracts");
        assert_eq!(parsed.evidence, None);
        assert_eq!(parsed.confidence, Confidence::Unknown);
    }

    #[test]
    fn test_parse_case_insensitive_labels() {
        let parsed = parse_final_answer("final_answer: yes\nconfidence: Medium");
        assert_eq!(parsed.answer, "yes");
        assert_eq!(parsed.confidence, Confidence::Medium);
    }

    #[test]
    fn test_parse_falls_back_to_whole_response() {
        let parsed = parse_final_answer("FINAL_ANSWER:\nCONFIDENCE: low");
        assert_eq!(parsed.answer, "FINAL_ANSWER:\nCONFIDENCE: low");
        assert_eq!(parsed.confidence, Confidence::Low);
    }

    #[test]
    fn test_truncate_short_output_unchanged() {
        assert_eq!(truncate_output("hello"), "hello");
    }

    #[test]
    fn test_truncate_long_output() {
        let output = "x".repeat(25_000);
        let truncated = truncate_output(&output);
        assert!(truncated.starts_with(&"x".repeat(20_000)));
        assert!(truncated.ends_with("\n... [OUTPUT TRUNCATED: 25,000 chars total, showing first 20,000]"));
    }

    #[test]
    fn test_truncate_counts_characters() {
        let output = "é".repeat(MAX_OUTPUT_CHARS);
        assert_eq!(truncate_output(&output), output);
    }

    #[test]
    fn test_clip_chars() {
        assert_eq!(clip_chars("héllo", 2), "hé");
        assert_eq!(clip_chars("abc", 10), "abc");
        assert_eq!(clip_chars("", 0), "");
    }

    #[test]
    fn test_with_thousands() {
        assert_eq!(with_thousands(0), "0");
        assert_eq!(with_thousands(999), "999");
        assert_eq!(with_thousands(1_000), "1,000");
        assert_eq!(with_thousands(1_234_567), "1,234,567");
    }
}
