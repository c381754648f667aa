//! PII masking for narrative text.
//!
//! Applied to section bodies and warnings only. Machine fields such as
//! citations and traces are never touched.

use std::sync::OnceLock;

use regex::Regex;

pub const EMAIL_TOKEN: &str = "[REDACTED_EMAIL]";
pub const NUMBER_TOKEN: &str = "[REDACTED_NUMBER]";
pub const NAME_TOKEN: &str = "[REDACTED_NAME]";

struct Patterns {
    email: Regex,
    number: Regex,
    name: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
            .expect("valid email regex"),
        number: Regex::new(r"\d{10,}").expect("valid digit run regex"),
        name: Regex::new(r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b").expect("valid name pair regex"),
    })
}

/// Mask email addresses, long digit runs and two-word capitalized names.
///
/// Emails go first so their local part is never split by the other rules.
/// The output contains no match for any rule, so redacting twice is a no-op.
pub fn redact(text: &str) -> String {
    let p = patterns();
    let masked = p.email.replace_all(text, EMAIL_TOKEN);
    let masked = p.number.replace_all(&masked, NUMBER_TOKEN);
    p.name.replace_all(&masked, NAME_TOKEN).into_owned()
}
