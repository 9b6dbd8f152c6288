//! Filename rules for everything a client is allowed to place inside a sandbox.
//!
//! Names arrive from untrusted JSON and end up as path components, so the
//! accepted alphabet is deliberately tiny: ASCII alphanumerics, `_`, `-` and `.`.
//! Parent-directory segments and separators are rejected outright.

use std::fmt;

/// Extension every include file must carry.
pub const INCLUDE_EXTENSION: &str = ".inc";
/// Extension of the source file written for each unit.
pub const SOURCE_EXTENSION: &str = ".sma";
/// Extension of the compiled binary produced for each unit.
pub const BINARY_EXTENSION: &str = ".amxx";

/// Returns `true` when `name` is safe to use as a single path component.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

/// Returns `true` when `name` is a safe filename that also ends in [`INCLUDE_EXTENSION`].
pub fn is_include_filename(name: &str) -> bool {
    is_safe_filename(name) && name.ends_with(INCLUDE_EXTENSION)
}

/// A sanitized source unit name, usable as a file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitName(String);

impl UnitName {
    /// Sanitize a client-supplied name, falling back to `plugin_{position}` (1-based)
    /// when the name is missing or unsafe. A leading `-` is stripped so the source
    /// filename can never be read as a compiler option.
    pub fn sanitize(raw: Option<&str>, position: usize) -> Self {
        raw.filter(|name| is_safe_filename(name))
            .map(|name| {
                name.trim_start_matches(['.', '_', '-'])
                    .trim_end_matches(['.', '_'])
            })
            .filter(|stem| !stem.is_empty())
            .map(|stem| Self(stem.to_string()))
            .unwrap_or_else(|| Self::positional(position))
    }

    pub fn positional(position: usize) -> Self {
        Self(format!("plugin_{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source_filename(&self) -> String {
        format!("{}{SOURCE_EXTENSION}", self.0)
    }

    pub fn binary_filename(&self) -> String {
        format!("{}{BINARY_EXTENSION}", self.0)
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_separators_empty_and_spaces() {
        for name in ["../evil", "a/b.inc", "", "ok name.inc", "a\\b.inc", "..", "x..y"] {
            assert!(!is_safe_filename(name), "`{name}` should be rejected");
        }
    }

    #[test]
    fn accepts_plain_names() {
        for name in ["plugin_1.sma", "my-plugin", "fakemeta_util.inc", "A1"] {
            assert!(is_safe_filename(name), "`{name}` should be accepted");
        }
    }

    #[test]
    fn include_names_require_extension() {
        assert!(is_include_filename("colorchat.inc"));
        assert!(!is_include_filename("colorchat.txt"));
        assert!(!is_include_filename("../colorchat.inc"));
    }

    #[test]
    fn rejects_non_ascii_alphanumerics() {
        assert!(!is_safe_filename("plügin"));
        assert!(!is_safe_filename("插件"));
    }

    #[test]
    fn unit_name_falls_back_to_position() {
        assert_eq!(UnitName::sanitize(None, 3).as_str(), "plugin_3");
        assert_eq!(UnitName::sanitize(Some("../x"), 1).as_str(), "plugin_1");
        assert_eq!(UnitName::sanitize(Some("bad name"), 2).as_str(), "plugin_2");
        assert_eq!(UnitName::sanitize(Some("._."), 4).as_str(), "plugin_4");
    }

    #[test]
    fn unit_name_strips_hidden_file_prefixes() {
        let name = UnitName::sanitize(Some(".hidden_"), 1);
        assert_eq!(name.as_str(), "hidden");
        assert_eq!(name.source_filename(), "hidden.sma");
        assert_eq!(name.binary_filename(), "hidden.amxx");
    }

    #[test]
    fn unit_name_never_starts_with_an_option_dash() {
        assert_eq!(UnitName::sanitize(Some("-ofoo"), 1).as_str(), "ofoo");
        assert_eq!(UnitName::sanitize(Some("--i.-x"), 1).as_str(), "i.-x");
        assert_eq!(UnitName::sanitize(Some("---"), 5).as_str(), "plugin_5");
        assert_eq!(UnitName::sanitize(Some("my-plugin"), 1).as_str(), "my-plugin");
    }
}
