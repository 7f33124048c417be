//! INI-style configuration reader, grounded on `ConfigParser`/`ConfigTnkzr`:
//! blanks `" \t\r"`, newline `"\n"`, single-char operators `"=[]"`, line
//! comments starting with `#`, and double-quoted strings with `\` escapes.
//!
//! `[section]` opens a namespace (`[]` reopens the unnamed/global one);
//! every following `key = value` line belongs to it until the next header.
//! A value can be a quoted string, a bareword, or a number, and may
//! reference an earlier value with `$section.key` or an environment
//! variable with `$_env.NAME`.

use std::collections::HashMap;
use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}:{1}: unterminated string literal")]
    UnterminatedString(usize, usize),
    #[error("{0}:{1}: expected '=' after key {2:?}")]
    ExpectedEquals(usize, usize, String),
    #[error("{0}:{1}: expected a value after '='")]
    ExpectedValue(usize, usize),
    #[error("{0}:{1}: unresolved reference ${2}")]
    UnresolvedReference(usize, usize, String),
    #[error("{0}:{1}: unexpected token {2:?}")]
    UnexpectedToken(usize, usize, String),
}

/// A fully parsed config: section name ("" for the global namespace) to its
/// ordered key/value pairs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    sections: HashMap<String, Vec<(String, String)>>,
}

impl Config {
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All key/value pairs in `section`, in file order.
    pub fn section(&self, section: &str) -> &[(String, String)] {
        self.sections
            .get(section)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}

struct Line<'a> {
    number: usize,
    text: &'a str,
}

/// Strips a `#`-prefixed comment that starts outside of a quoted string.
fn strip_comment(text: &str) -> &str {
    let mut in_string = false;
    let mut escape = false;
    for (idx, ch) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return &text[..idx],
            _ => {}
        }
    }
    text
}

fn unquote(raw: &str, line: usize) -> Result<String, ConfigError> {
    let bytes: Vec<char> = raw.chars().collect();
    if bytes.first() != Some(&'"') {
        return Ok(raw.to_string());
    }

    let mut out = String::new();
    let mut i = 1;
    let mut closed = false;
    while i < bytes.len() {
        match bytes[i] {
            '\\' if i + 1 < bytes.len() => {
                out.push(bytes[i + 1]);
                i += 2;
            }
            '"' => {
                closed = true;
                i += 1;
                break;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    if !closed {
        return Err(ConfigError::UnterminatedString(line, 0));
    }

    Ok(out)
}

/// Parses `source` into a [`Config`], resolving `$section.key` and
/// `$_env.NAME` references as they're encountered (so a reference can only
/// see sections that appear earlier in the file, matching the original's
/// single top-to-bottom pass).
pub fn parse(source: &str) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    let mut current_section = String::new();
    cfg.sections.entry(current_section.clone()).or_default();

    let lines: Vec<Line> = source
        .lines()
        .enumerate()
        .map(|(i, text)| Line {
            number: i + 1,
            text: strip_comment(text),
        })
        .collect();

    for line in lines {
        let trimmed = line.text.trim_matches(|c: char| c == ' ' || c == '\t' || c == '\r');
        if trimmed.is_empty() {
            continue;
        }

        if let Some(inner) = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
        {
            current_section = inner.trim().to_string();
            cfg.sections.entry(current_section.clone()).or_default();
            continue;
        }

        let Some(eq_idx) = find_top_level_eq(trimmed) else {
            return Err(ConfigError::ExpectedEquals(
                line.number,
                0,
                trimmed.to_string(),
            ));
        };

        let key = trimmed[..eq_idx].trim().to_string();
        let raw_value = trimmed[eq_idx + 1..].trim();

        if raw_value.is_empty() {
            return Err(ConfigError::ExpectedValue(line.number, 0));
        }

        let value = if let Some(reference) = raw_value.strip_prefix('$') {
            resolve_reference(&cfg, reference, line.number)?
        } else {
            unquote(raw_value, line.number)?
        };

        cfg.sections
            .entry(current_section.clone())
            .or_default()
            .push((key, value));
    }

    Ok(cfg)
}

fn find_top_level_eq(text: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escape = false;
    for (idx, ch) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '=' if !in_string => return Some(idx),
            _ => {}
        }
    }
    None
}

fn resolve_reference(cfg: &Config, reference: &str, line: usize) -> Result<String, ConfigError> {
    if let Some(name) = reference.strip_prefix("_env.") {
        return env::var(name)
            .map_err(|_| ConfigError::UnresolvedReference(line, 0, reference.to_string()));
    }

    let (section, key) = reference
        .split_once('.')
        .ok_or_else(|| ConfigError::UnresolvedReference(line, 0, reference.to_string()))?;

    cfg.get(section, key)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::UnresolvedReference(line, 0, reference.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_bare_values() {
        let cfg = parse(
            "[ns1]\nlocal_address = 10.0.0.1\nport = 28774\n[dns]\nhosts = \"/etc/hosts.mp\"\n",
        )
        .unwrap();

        assert_eq!(cfg.get("ns1", "local_address"), Some("10.0.0.1"));
        assert_eq!(cfg.get("ns1", "port"), Some("28774"));
        assert_eq!(cfg.get("dns", "hosts"), Some("/etc/hosts.mp"));
    }

    #[test]
    fn global_namespace_uses_empty_section_name() {
        let cfg = parse("verbose = 1\n[]\nmode = \"quiet\"\n").unwrap();
        assert_eq!(cfg.get("", "verbose"), Some("1"));
        assert_eq!(cfg.get("", "mode"), Some("quiet"));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let cfg = parse("# a comment\n\n[ns1]\nkey = \"value\" # trailing comment\n").unwrap();
        assert_eq!(cfg.get("ns1", "key"), Some("value"));
    }

    #[test]
    fn references_resolve_against_earlier_sections() {
        let cfg = parse("[ns1]\nhost = \"10.0.0.9\"\n[ns2]\npeer = $ns1.host\n").unwrap();
        assert_eq!(cfg.get("ns2", "peer"), Some("10.0.0.9"));
    }

    #[test]
    fn env_references_pull_from_the_process_environment() {
        std::env::set_var("ACSGW_TEST_VAR", "from-env");
        let cfg = parse("[ns1]\nsecret = $_env.ACSGW_TEST_VAR\n").unwrap();
        assert_eq!(cfg.get("ns1", "secret"), Some("from-env"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = parse("[ns1]\nkey = \"unterminated\n");
        assert!(err.is_err());
    }

    #[test]
    fn missing_equals_is_an_error() {
        let err = parse("[ns1]\njust_a_word\n");
        assert!(matches!(err, Err(ConfigError::ExpectedEquals(..))));
    }
}
