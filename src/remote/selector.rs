//! Parsing of PromQL-style series selectors such as
//! `http_requests_total{job="api",code=~"5.."}` into remote-read matchers.

use regex::Regex;

use super::prompb::{LabelMatcher, MatchType, LABEL_METRIC_NAME};
use crate::error::MigrateError;

/// Selector used when none is configured: every named series.
pub const DEFAULT_SELECTOR: &str = r#"{__name__=~".+"}"#;

pub fn parse_selector(input: &str) -> Result<Vec<LabelMatcher>, MigrateError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid(input, "selector is empty"));
    }

    let (metric, body) = match input.find('{') {
        Some(open) => {
            let Some(body) = input[open + 1..].strip_suffix('}') else {
                return Err(invalid(input, "missing closing '}'"));
            };
            (input[..open].trim(), Some(body))
        }
        None => (input, None),
    };

    let mut matchers = Vec::new();
    if !metric.is_empty() {
        if !is_metric_name(metric) {
            return Err(invalid(input, &format!("invalid metric name '{metric}'")));
        }
        matchers.push(LabelMatcher::new(MatchType::Eq, LABEL_METRIC_NAME, metric));
    }
    if let Some(body) = body {
        parse_matchers(input, body, &mut matchers)?;
    }

    if matchers.is_empty() {
        return Err(invalid(input, "selector has no matchers"));
    }
    let mut any_non_empty = false;
    for matcher in &matchers {
        if !matches_empty(matcher).map_err(|err| invalid(input, &err))? {
            any_non_empty = true;
        }
    }
    if !any_non_empty {
        return Err(invalid(
            input,
            "selector must contain at least one matcher that does not match the empty string",
        ));
    }
    Ok(matchers)
}

fn parse_matchers(
    input: &str,
    body: &str,
    matchers: &mut Vec<LabelMatcher>,
) -> Result<(), MigrateError> {
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if !is_label_name(name) {
            return Err(invalid(input, "expected a label name"));
        }
        rest = rest[name_len..].trim_start();

        let (kind, op_len) = if rest.starts_with("=~") {
            (MatchType::Re, 2)
        } else if rest.starts_with("!~") {
            (MatchType::Nre, 2)
        } else if rest.starts_with("!=") {
            (MatchType::Neq, 2)
        } else if rest.starts_with('=') {
            (MatchType::Eq, 1)
        } else {
            return Err(invalid(
                input,
                &format!("expected one of =, !=, =~, !~ after '{name}'"),
            ));
        };
        rest = rest[op_len..].trim_start();

        let (value, consumed) = parse_quoted(rest).ok_or_else(|| {
            invalid(input, &format!("expected a quoted value for label '{name}'"))
        })?;
        if matches!(kind, MatchType::Re | MatchType::Nre) {
            anchored(&value).map_err(|err| invalid(input, &err))?;
        }
        matchers.push(LabelMatcher::new(kind, name, value));
        rest = rest[consumed..].trim_start();

        match rest.strip_prefix(',') {
            Some(after) => rest = after.trim_start(),
            None if rest.is_empty() => {}
            None => return Err(invalid(input, "expected ',' between matchers")),
        }
    }
    Ok(())
}

/// Returns the unescaped string and the number of bytes consumed, including
/// both quotes.
fn parse_quoted(input: &str) -> Option<(String, usize)> {
    let mut chars = input.char_indices();
    let (_, quote) = chars.next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let mut value = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            match c {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                other => value.push(other),
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some((value, idx + c.len_utf8()));
        } else {
            value.push(c);
        }
    }
    None
}

fn is_label_name(name: &str) -> bool {
    is_name(name, false)
}

/// Metric names additionally allow ':' for recording rules.
fn is_metric_name(name: &str) -> bool {
    is_name(name, true)
}

fn is_name(name: &str, allow_colon: bool) -> bool {
    let allowed = |c: char| c.is_ascii_alphabetic() || c == '_' || (allow_colon && c == ':');
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if allowed(c) => {}
        _ => return false,
    }
    chars.all(|c| allowed(c) || c.is_ascii_digit())
}

fn anchored(pattern: &str) -> Result<Regex, String> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|err| format!("invalid regex: {err}"))
}

fn matches_empty(matcher: &LabelMatcher) -> Result<bool, String> {
    Ok(match matcher.kind() {
        MatchType::Eq => matcher.value.is_empty(),
        MatchType::Neq => !matcher.value.is_empty(),
        MatchType::Re => anchored(&matcher.value)?.is_match(""),
        MatchType::Nre => !anchored(&matcher.value)?.is_match(""),
    })
}

fn invalid(input: &str, reason: &str) -> MigrateError {
    MigrateError::Config(format!("selector '{input}': {reason}"))
}
