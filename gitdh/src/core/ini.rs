//! INI text parsing for `gitdh.conf` style files.
//!
//! Follows the conventions of Python's `configparser` that existing
//! configurations rely on: `key = value` or `key: value`, full-line `#`/`;`
//! comments, indented continuation lines, case-insensitive keys and
//! case-sensitive section names. Duplicate sections or keys are rejected.

use crate::core::config::Configuration;
use crate::error::ConfigError;

/// Parse INI text. `origin` labels errors (a file path or `branch:file`).
pub fn parse_ini(text: &str, origin: &str) -> Result<Configuration, ConfigError> {
    let mut config = Configuration::default();
    let mut current: Option<String> = None;
    let mut last_key: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            last_key = None;
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        let indented = trimmed.len() != line.len();
        if indented && let (Some(section), Some(key)) = (&current, &last_key) {
            config.append_value(section, key, trimmed);
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| parse_error(origin, line_no, "unterminated section header"))?
                .trim();
            if name.is_empty() {
                return Err(parse_error(origin, line_no, "empty section name"));
            }
            if config.section(name).is_some() {
                return Err(parse_error(
                    origin,
                    line_no,
                    &format!("duplicate section [{name}]"),
                ));
            }
            config.add_section(name);
            current = Some(name.to_string());
            last_key = None;
            continue;
        }

        let Some(section) = &current else {
            return Err(parse_error(origin, line_no, "key outside of a section"));
        };
        let (key, value) = split_entry(trimmed)
            .ok_or_else(|| parse_error(origin, line_no, "expected 'key = value'"))?;
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(parse_error(origin, line_no, "empty key"));
        }
        if config
            .section(section)
            .is_some_and(|s| s.get(&key).is_some())
        {
            return Err(parse_error(
                origin,
                line_no,
                &format!("duplicate key '{key}' in section [{section}]"),
            ));
        }
        config.set(section, &key, value.trim());
        last_key = Some(key);
    }

    Ok(config)
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c| c == '=' || c == ':')?;
    Some((&line[..idx], &line[idx + 1..]))
}

fn parse_error(origin: &str, line: usize, message: &str) -> ConfigError {
    ConfigError::Parse {
        origin: origin.to_string(),
        line,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_in_order_with_lowercased_keys() {
        let config = parse_ini(
            "[Git]\nRepositoryPath = /srv/repo\n\n[main]\nPath: /var/www\n",
            "test.conf",
        )
        .expect("parse");

        let names: Vec<&str> = config.sections().map(|s| s.name()).collect();
        assert_eq!(names, vec!["Git", "main"]);
        assert_eq!(config.get("Git", "repositorypath"), Some("/srv/repo"));
        assert_eq!(config.get("main", "PATH"), Some("/var/www"));
    }

    #[test]
    fn joins_indented_continuation_lines() {
        let config = parse_ini(
            "[main]\ncommand = make build\n    make install\n# trailing comment\n",
            "test.conf",
        )
        .expect("parse");
        assert_eq!(config.get("main", "command"), Some("make build\nmake install"));
    }

    #[test]
    fn value_may_contain_delimiters() {
        let config = parse_ini("[main]\ncommand = echo a=b: c\n", "test.conf").expect("parse");
        assert_eq!(config.get("main", "command"), Some("echo a=b: c"));
    }

    #[test]
    fn rejects_keys_outside_sections() {
        let err = parse_ini("key = value\n", "test.conf").unwrap_err();
        assert_eq!(err.to_string(), "test.conf:1: key outside of a section");
    }

    #[test]
    fn rejects_duplicate_sections_and_keys() {
        let err = parse_ini("[a]\n[a]\n", "test.conf").unwrap_err();
        assert!(err.to_string().contains("duplicate section [a]"));

        let err = parse_ini("[a]\nx = 1\nX = 2\n", "test.conf").unwrap_err();
        assert!(err.to_string().contains("duplicate key 'x'"));
    }

    #[test]
    fn rejects_lines_without_delimiter() {
        let err = parse_ini("[a]\njust words\n", "test.conf").unwrap_err();
        assert!(err.to_string().contains("test.conf:2"));
    }
}
