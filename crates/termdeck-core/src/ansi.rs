//! ANSI escape sequence stripping.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// CSI and related escapes: `ESC[` (or lone `CSI`) with optional parameter
/// bytes, terminated by the standard final-byte family.
static CSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x1b\x9b][\[()#;?]*(?:[0-9]{1,4}(?:;[0-9]{0,4})*)?[0-9A-ORZcf-nqry=><]")
        .expect("csi pattern")
});

/// OSC sequences: `ESC]` up to BEL or ST.
static OSC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?").expect("osc pattern"));

/// Remove ANSI CSI/OSC escape sequences from `input`.
///
/// Classification must be escape-blind: `classify(strip_ansi(x))` and
/// `classify(x)` agree because classification always runs on stripped text.
pub fn strip_ansi(input: &str) -> String {
    let pass1: Cow<'_, str> = OSC_RE.replace_all(input, "");
    CSI_RE.replace_all(&pass1, "").into_owned()
}
