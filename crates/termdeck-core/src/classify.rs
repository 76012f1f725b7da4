//! Delta classification: error > question > status > output.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::EventKind;

static ERROR_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*error:",
        r"(?i)^\s*fatal:",
        r"(?i)exception:",
        r"(?i)failed:",
        r"(?i)\berror\b.*:",
        r"(?i)panic:",
        r"(?i)traceback",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("error pattern"))
    .collect()
});

/// The AskUserQuestion render: a `☐ <header>` line followed (eventually) by
/// the "Enter to select" hint.
static ASK_QUESTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)☐.*enter to select").expect("ask pattern"));

static QUESTION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\(y/n\)",
        r"(?i)\[y/n\]",
        r"(?i)press enter",
        r"(?i)continue\?",
        r"(?i)proceed\?",
        r"(?i)confirm",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("question pattern"))
    .collect()
});

static STATUS_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Bare shell prompt waiting for input.
        r"^\s*[$>]\s*$",
        r"(?i)\bbuild (done|completed|finished)\s*$",
        r"(?i)(\bdone\.|\bcompleted\b|\bfinished\b)\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("status pattern"))
    .collect()
});

/// Classify a delta. First match wins, in priority order.
///
/// Strips escapes before matching, so classification agrees on raw and
/// pre-stripped input.
pub fn classify(raw: &str) -> EventKind {
    let stripped = crate::ansi::strip_ansi(raw);
    let text = stripped.as_str();

    if text.lines().any(|line| ERROR_RES.iter().any(|re| re.is_match(line))) {
        return EventKind::Error;
    }

    if is_question(text) {
        return EventKind::Question;
    }

    if text.lines().any(|line| STATUS_RES.iter().any(|re| re.is_match(line))) {
        return EventKind::Status;
    }

    EventKind::Output
}

fn is_question(text: &str) -> bool {
    if ASK_QUESTION_RE.is_match(text) {
        return true;
    }
    if text.trim_end().ends_with('?') {
        return true;
    }
    text.lines()
        .any(|line| QUESTION_RES.iter().any(|re| re.is_match(line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ansi::strip_ansi;

    #[test]
    fn classifies_errors_first() {
        assert_eq!(classify("error: no such file"), EventKind::Error);
        assert_eq!(classify("FATAL: out of memory"), EventKind::Error);
        assert_eq!(classify("  caught IOException: broken pipe"), EventKind::Error);
        assert_eq!(classify("tests failed: 3 of 10"), EventKind::Error);
        assert_eq!(classify("thread 'main' panic: oh no"), EventKind::Error);
        assert_eq!(classify("Traceback (most recent call last)"), EventKind::Error);
        assert_eq!(classify("build error in main.rs:"), EventKind::Error);
    }

    #[test]
    fn error_beats_question_on_the_same_delta() {
        assert_eq!(classify("error: retry? (y/n)"), EventKind::Error);
    }

    #[test]
    fn classifies_questions() {
        assert_eq!(classify("Overwrite file? (y/n)"), EventKind::Question);
        assert_eq!(classify("Delete everything [y/N]"), EventKind::Question);
        assert_eq!(classify("Apply changes [Y/n]"), EventKind::Question);
        assert_eq!(classify("Press enter to continue"), EventKind::Question);
        assert_eq!(classify("Which branch do you want?"), EventKind::Question);
        assert_eq!(classify("Please confirm the deploy"), EventKind::Question);
    }

    #[test]
    fn classifies_ask_user_question_block() {
        let block = "☐ Auth method\nWhich authentication method should we use?\n❯ 1. OAuth\n  2. API key\nEnter to select";
        assert_eq!(classify(block), EventKind::Question);
    }

    #[test]
    fn classifies_status() {
        assert_eq!(classify("$"), EventKind::Status);
        assert_eq!(classify("> "), EventKind::Status);
        assert_eq!(classify("done."), EventKind::Status);
        assert_eq!(classify("task completed"), EventKind::Status);
        assert_eq!(classify("build finished"), EventKind::Status);
    }

    #[test]
    fn everything_else_is_output() {
        assert_eq!(classify("compiling termdeck v0.1.0"), EventKind::Output);
        assert_eq!(classify("hello world"), EventKind::Output);
        assert_eq!(classify("downloaded 4 crates"), EventKind::Output);
    }

    #[test]
    fn classification_is_strip_invariant() {
        let samples = [
            "\x1b[31merror: bad\x1b[0m",
            "\x1b[1mProceed? (y/n)\x1b[0m",
            "\x1b[32mdone.\x1b[0m",
            "plain output line",
        ];
        for s in samples {
            assert_eq!(
                classify(&strip_ansi(s)),
                classify(s),
                "classification must not depend on escapes: {s:?}"
            );
        }
    }
}
