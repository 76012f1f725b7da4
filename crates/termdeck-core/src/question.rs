//! Structured parsing of AskUserQuestion prompt blocks.
//!
//! The external agent renders interactive questions as:
//!
//! ```text
//! ☐ Auth method
//! Which authentication method should we use?
//! ❯ 1. OAuth
//!      Redirect users to the provider
//!   2. API key
//! Enter to select
//! ```

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{QuestionMetadata, QuestionOption};

static OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:❯\s*)?(\d+)\.\s+(.+)$").expect("option pattern"));

/// Attempt a structured parse of an AskUserQuestion block.
///
/// Succeeds only when a `☐ <header>` line and at least one numbered option
/// are recovered. The question text is the first line ending in `?` within
/// the block (empty when the block carries none).
pub fn parse_ask_user_question(text: &str) -> Option<QuestionMetadata> {
    let lines: Vec<&str> = text.lines().collect();

    let header_idx = lines
        .iter()
        .position(|line| line.trim_start().starts_with('☐'))?;
    let header = lines[header_idx]
        .trim_start()
        .trim_start_matches('☐')
        .trim()
        .to_string();
    if header.is_empty() {
        return None;
    }

    let question = lines
        .iter()
        .map(|line| line.trim())
        .find(|line| line.ends_with('?'))
        .unwrap_or_default()
        .to_string();

    let mut options: Vec<QuestionOption> = Vec::new();
    let mut in_continuation = false;

    for line in &lines[header_idx + 1..] {
        if let Some(caps) = OPTION_RE.captures(line) {
            let number = caps[1].parse::<u32>().ok()?;
            options.push(QuestionOption {
                number,
                label: caps[2].trim().to_string(),
                description: None,
            });
            in_continuation = true;
            continue;
        }

        if in_continuation && is_description_continuation(line) {
            let current = options.last_mut()?;
            let fragment = line.trim();
            match &mut current.description {
                Some(desc) => {
                    desc.push(' ');
                    desc.push_str(fragment);
                }
                None => current.description = Some(fragment.to_string()),
            }
        } else {
            in_continuation = false;
        }
    }

    if options.is_empty() {
        return None;
    }

    Some(QuestionMetadata {
        header,
        question,
        options,
    })
}

/// A description continuation is an indented, non-empty line that is neither
/// a dash bullet nor a separator rule.
fn is_description_continuation(line: &str) -> bool {
    if !line.starts_with(char::is_whitespace) {
        return false;
    }
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') {
        return false;
    }
    !trimmed.chars().all(|c| matches!(c, '─' | '━' | '═' | '·'))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of the parser, for the parse-render roundtrip law.
    fn render(q: &QuestionMetadata) -> String {
        let mut out = String::new();
        out.push_str(&format!("☐ {}\n", q.header));
        if !q.question.is_empty() {
            out.push_str(&format!("{}\n", q.question));
        }
        for (i, opt) in q.options.iter().enumerate() {
            let marker = if i == 0 { "❯ " } else { "  " };
            out.push_str(&format!("{}{}. {}\n", marker, opt.number, opt.label));
            if let Some(desc) = &opt.description {
                out.push_str(&format!("     {desc}\n"));
            }
        }
        out.push_str("Enter to select");
        out
    }

    fn sample() -> QuestionMetadata {
        QuestionMetadata {
            header: "Auth method".into(),
            question: "Which authentication method should we use?".into(),
            options: vec![
                QuestionOption {
                    number: 1,
                    label: "OAuth".into(),
                    description: Some("Redirect users to the provider".into()),
                },
                QuestionOption {
                    number: 2,
                    label: "API key".into(),
                    description: None,
                },
                QuestionOption {
                    number: 3,
                    label: "Session cookie".into(),
                    description: None,
                },
                QuestionOption {
                    number: 4,
                    label: "mTLS".into(),
                    description: None,
                },
            ],
        }
    }

    #[test]
    fn parses_full_block() {
        let parsed = parse_ask_user_question(&render(&sample())).expect("parse");
        assert_eq!(parsed, sample());
    }

    #[test]
    fn parse_render_roundtrip_without_descriptions() {
        let q = QuestionMetadata {
            header: "Pick one".into(),
            question: "Ready?".into(),
            options: vec![
                QuestionOption {
                    number: 1,
                    label: "Yes".into(),
                    description: None,
                },
                QuestionOption {
                    number: 2,
                    label: "No".into(),
                    description: None,
                },
            ],
        };
        assert_eq!(parse_ask_user_question(&render(&q)), Some(q));
    }

    #[test]
    fn multi_line_description_joined_by_spaces() {
        let block = "☐ Storage\nWhere should data live?\n❯ 1. Local\n     on this machine,\n     no network needed\n  2. Remote\n";
        let parsed = parse_ask_user_question(block).expect("parse");
        assert_eq!(
            parsed.options[0].description.as_deref(),
            Some("on this machine, no network needed")
        );
        assert_eq!(parsed.options[1].description, None);
    }

    #[test]
    fn separator_and_dash_lines_are_not_descriptions() {
        let block = "☐ Choice\nGo?\n❯ 1. A\n   ────────\n   - not a description\n  2. B\n";
        let parsed = parse_ask_user_question(block).expect("parse");
        assert_eq!(parsed.options[0].description, None);
    }

    #[test]
    fn missing_header_fails() {
        assert_eq!(parse_ask_user_question("Pick?\n1. A\n2. B"), None);
        assert_eq!(parse_ask_user_question("☐\n1. A"), None);
    }

    #[test]
    fn missing_options_fails() {
        assert_eq!(parse_ask_user_question("☐ Header\nJust a question?"), None);
    }

    #[test]
    fn question_defaults_to_empty_when_no_question_mark() {
        let block = "☐ Mode\n❯ 1. Fast\n  2. Safe\n";
        let parsed = parse_ask_user_question(block).expect("parse");
        assert_eq!(parsed.question, "");
        assert_eq!(parsed.options.len(), 2);
    }

    #[test]
    fn leading_noise_before_header_is_tolerated() {
        let block = "some earlier output\n☐ Region\nWhich region?\n❯ 1. us-east\n  2. eu-west\n";
        let parsed = parse_ask_user_question(block).expect("parse");
        assert_eq!(parsed.header, "Region");
        assert_eq!(parsed.options.len(), 2);
    }
}
