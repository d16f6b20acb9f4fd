use once_cell::sync::Lazy;
use regex::Regex;

const CODE_FENCE: &str = "```";

// Greedy on purpose: first `[` through the last `]`, newlines included.
static LIST_REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("list region pattern compiles"));

/// Turns a raw model reply into text the answer parsers can read.
///
/// This is a heuristic, not a grammar. It never fails: when no bracketed
/// region is present the trimmed text comes back as-is.
pub fn normalize_response_text(text: &str) -> String {
    let unfenced = strip_code_fence(text);
    let plain = normalize_quotes(&unfenced);
    match extract_list_region(&plain) {
        Some(region) => region.to_string(),
        None => plain.trim().to_string(),
    }
}

/// Removes a surrounding markdown code fence.
///
/// A fenced block of three or more lines loses its first and last line;
/// anything shorter just has the backticks peeled off both ends.
pub fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with(CODE_FENCE) && raw.ends_with(CODE_FENCE)) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() >= 3 && lines[0].starts_with(CODE_FENCE) {
        return lines[1..lines.len() - 1].join("\n");
    }
    raw.trim_matches('`').trim().to_string()
}

pub fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

pub fn extract_list_region(text: &str) -> Option<&str> {
    LIST_REGION.find(text).map(|found| found.as_str())
}

#[cfg(test)]
mod tests {
    use super::{extract_list_region, normalize_quotes, normalize_response_text, strip_code_fence};

    #[test]
    fn well_formed_list_passes_through_unchanged() {
        let text = r#"[{"expr": "2 + 2", "result": 4}]"#;
        assert_eq!(normalize_response_text(text), text);
    }

    #[test]
    fn three_line_fence_drops_both_fence_lines() {
        let text = "```python\n[{'expr': 'x', 'result': 5, 'assign': True}]\n```";
        assert_eq!(
            normalize_response_text(text),
            "[{'expr': 'x', 'result': 5, 'assign': True}]"
        );
    }

    #[test]
    fn multi_line_fence_keeps_inner_lines() {
        let text = "```json\n[\n  {\"expr\": \"1 + 1\", \"result\": 2}\n]\n```";
        assert_eq!(
            strip_code_fence(text),
            "[\n  {\"expr\": \"1 + 1\", \"result\": 2}\n]"
        );
    }

    #[test]
    fn single_line_fence_strips_backticks() {
        assert_eq!(strip_code_fence("```[1, 2]```"), "[1, 2]");
        assert_eq!(strip_code_fence("  ``` ```  "), "");
    }

    #[test]
    fn unfenced_text_is_only_trimmed() {
        assert_eq!(strip_code_fence("  ```[1]  "), "```[1]");
    }

    #[test]
    fn smart_quotes_become_ascii() {
        assert_eq!(normalize_quotes("\u{201C}a\u{201D}"), "\"a\"");
        assert_eq!(normalize_quotes("\u{2018}b\u{2019}"), "'b'");
        assert_eq!(
            normalize_response_text("[{\u{201C}expr\u{201D}: \u{2018}y\u{2019}}]"),
            "[{\"expr\": 'y'}]"
        );
    }

    #[test]
    fn list_region_is_greedy_across_lines() {
        let text = "Here you go:\n[{'expr': '[a]'},\n {'expr': 'b'}]\nThanks!";
        assert_eq!(
            extract_list_region(text),
            Some("[{'expr': '[a]'},\n {'expr': 'b'}]")
        );
    }

    #[test]
    fn text_without_list_is_returned_trimmed() {
        assert_eq!(normalize_response_text("  no math here \n"), "no math here");
        assert_eq!(normalize_response_text(""), "");
        assert_eq!(normalize_response_text("] backwards ["), "] backwards [");
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let inputs = [
            "```\n[{'expr': '3 * 3', 'result': 9}]\n```",
            "Answer: [{\u{201C}expr\u{201D}: \u{201C}love\u{201D}, \u{201C}result\u{201D}: \u{201C}emotion\u{201D}}] done",
            "[]",
            "nothing",
        ];
        for input in inputs {
            let once = normalize_response_text(input);
            assert_eq!(normalize_response_text(&once), once, "input: {input}");
        }
    }
}
