//! Per-response nonces and their injection into rendered HTML.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static OPENING_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(script|style)\b([^>]*)>").expect("opening tag pattern is a valid literal")
});

static QUOTED_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""[^"]*"|'[^']*'"#).expect("quoted value pattern is a valid literal")
});

static NONCE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|\s)nonce(?:\s*=|\s|/|$)").expect("nonce attribute pattern is a valid literal")
});

/// Fresh nonce: 16 random bytes, standard base64.
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    STANDARD.encode(bytes)
}

/// Add `nonce="<nonce>"` to every `<script>` and `<style>` opening tag that
/// lacks one. Tags that already carry a nonce are left alone, so applying
/// this twice with the same nonce changes nothing.
#[must_use]
pub fn inject_nonce(html: &str, nonce: &str) -> String {
    OPENING_TAG
        .replace_all(html, |caps: &Captures<'_>| {
            let attrs = &caps[2];
            if has_nonce_attr(attrs) {
                caps[0].to_string()
            } else {
                format!("<{} nonce=\"{nonce}\"{attrs}>", &caps[1])
            }
        })
        .into_owned()
}

/// Attribute values are blanked first so text inside quotes never counts as
/// an attribute name.
fn has_nonce_attr(attrs: &str) -> bool {
    NONCE_ATTR.is_match(&QUOTED_VALUE.replace_all(attrs, "\"\""))
}
