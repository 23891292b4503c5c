//! Cluster-safe identifier generation.
//!
//! Identifiers double as Kubernetes resource names, so they must satisfy the
//! RFC 1123 label rules and stay under 63 characters. The layout is
//! `<name>-<namespace>-<digits>` with both parts truncated to 25 characters
//! before sanitizing, which keeps the total within bounds.

use rand::Rng;

const MAX_NAME_LEN: usize = 25;
const MAX_NAMESPACE_LEN: usize = 25;
const MAX_IDENTIFIER_LEN: usize = 63;

/// Fallback segment when sanitizing leaves nothing usable.
const FALLBACK_SEGMENT: &str = "deployment";

/// Generates an identifier for a (name, namespace) pair.
///
/// The trailing random digits make collisions for repeated pairs unlikely;
/// the store's unique index catches the rest.
pub fn generate_identifier(name: &str, namespace: &str) -> String {
    let name = sanitize_segment(&truncate(name, MAX_NAME_LEN));
    let namespace = sanitize_segment(&truncate(namespace, MAX_NAMESPACE_LEN));
    let digits = rand::thread_rng().gen_range(100..1000);

    let mut identifier = format!("{}-{}-{}", name, namespace, digits);

    if identifier.len() > MAX_IDENTIFIER_LEN {
        identifier.truncate(MAX_IDENTIFIER_LEN);
        if identifier.ends_with('-') {
            identifier.pop();
            identifier.push('0');
        }
    }

    identifier
}

/// Lowercases, replaces invalid characters with hyphens, collapses hyphen
/// runs and trims the ends. An empty result falls back to a fixed segment.
fn sanitize_segment(s: &str) -> String {
    let lowered = s.to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut last_hyphen = false;
    for c in lowered.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' {
            if last_hyphen {
                continue;
            }
            last_hyphen = true;
        } else {
            last_hyphen = false;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_SEGMENT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Truncates to at most `max_len` characters without splitting a character.
fn truncate(s: &str, max_len: usize) -> String {
    s.chars().take(max_len).collect()
}
