//! Parser for the compiler's diagnostic lines.
//!
//! The compiler reports problems as `<file>(<line>) : error <code>: <message>` (or
//! `warning`). Any other line is log noise and stays visible only in the raw log.

use once_cell::sync::Lazy;
use regex::Regex;

static ERROR_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*?\((\d+)\)\s+:\s+error\s+(\d+):\s+(.*)").expect("valid error pattern")
});

static WARNING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*?\((\d+)\)\s+:\s+warning\s+(\d+):\s+(.*)").expect("valid warning pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub code: u32,
    pub message: String,
}

impl Diagnostic {
    /// A diagnostic that does not originate from compiler output, such as a timeout.
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            line: 0,
            code: 0,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

/// Split compiler output into errors and warnings, line by line.
pub fn parse(log: &str) -> Diagnostics {
    let mut diagnostics = Diagnostics::default();

    for line in log.lines() {
        if let Some(found) = match_line(&ERROR_LINE, line) {
            diagnostics.errors.push(found);
        } else if let Some(found) = match_line(&WARNING_LINE, line) {
            diagnostics.warnings.push(found);
        }
    }

    diagnostics
}

// Numeric fields that do not fit are treated as a non-match for this line only.
fn match_line(pattern: &Regex, line: &str) -> Option<Diagnostic> {
    let captures = pattern.captures(line)?;
    let line_number = captures.get(1)?.as_str().parse::<u32>().ok()?;
    let code = captures.get(2)?.as_str().parse::<u32>().ok()?;
    let message = captures.get(3)?.as_str().trim().to_string();

    Some(Diagnostic {
        line: line_number,
        code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_error_line() {
        let parsed = parse(r#"foo.sma(12) : error 017: undefined symbol "bar""#);
        assert_eq!(
            parsed.errors,
            vec![Diagnostic {
                line: 12,
                code: 17,
                message: r#"undefined symbol "bar""#.to_string(),
            }]
        );
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn separates_errors_from_warnings_and_ignores_noise() {
        let log = "\
AMX Mod X Compiler 1.10.0.5467
Copyright (c) 1997-2006 ITB CompuPhase

demo.sma(3) : warning 217: loose indentation
demo.sma(9) : error 029: invalid expression, assumed zero   
demo.sma(10) : warning 215: expression has no effect

1 Error.
Could not locate output file demo.amxx (compile failed).
";
        let parsed = parse(log);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line, 9);
        assert_eq!(parsed.errors[0].message, "invalid expression, assumed zero");
        assert_eq!(parsed.warnings.len(), 2);
        assert_eq!(parsed.warnings[1].code, 215);
    }

    #[test]
    fn oversized_numbers_do_not_abort_later_lines() {
        let log = "a.sma(99999999999999999999) : error 001: overflow\nb.sma(4) : error 010: fine";
        let parsed = parse(log);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line, 4);
    }

    #[test]
    fn handles_windows_line_endings() {
        let parsed = parse("x.sma(1) : warning 200: name truncated\r\nnoise\r\n");
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].message, "name truncated");
    }

    #[test]
    fn empty_log_has_no_diagnostics() {
        assert_eq!(parse(""), Diagnostics::default());
    }
}
