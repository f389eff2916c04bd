//! `${VAR}` expansion for raw config text.

use std::env;

/// Expand `${VAR}` placeholders from the environment.
///
/// `${VAR:-fallback}` uses `fallback` when `VAR` is unset or empty. Unknown
/// variables without a fallback, empty names and unterminated placeholders
/// are kept verbatim.
pub fn substitute_env(input: &str) -> String {
    expand_with(input, |name| env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let Some(end) = body.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let placeholder = &rest[start..start + end + 3];
        let (name, fallback) = match body[..end].split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (&body[..end], None),
        };

        let replacement = if name.is_empty() {
            None
        } else {
            match (lookup(name), fallback) {
                (Some(value), Some(fallback)) if value.is_empty() => Some(fallback.to_owned()),
                (Some(value), _) => Some(value),
                (None, fallback) => fallback.map(str::to_owned),
            }
        };
        out.push_str(replacement.as_deref().unwrap_or(placeholder));
        rest = &body[end + 1..];
    }

    out.push_str(rest);
    out
}
