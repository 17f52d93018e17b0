//! Stack-trace rendering driven by short format strings.
//!
//! A format string is an ordered list of single-character specifiers:
//!
//! | char | meaning |
//! |------|---------|
//! | `a`  | prefix multi-line frames with an arrow |
//! | `c`  | colorize every other specifier |
//! | `f`  | function name without module path |
//! | `E`  | the checked expression in macro form, `ensure!(x)` |
//! | `L`  | full file path and line |
//! | `m`  | the frame message |
//! | `n`  | prefix every line with the frame index |
//! | `F`  | fully-qualified function path |
//! | `s`  | `file:line \| function \| message` |
//! | `e`  | the checked expression alone |
//! | `l`  | file basename and line |
//!
//! `v` and `V` expand to the verbose and very-verbose presets. For a whole
//! error, `/` separates the specifiers used for outer frames from those used
//! for the innermost frame, and `^` renders inner-to-outer instead of
//! outer-to-inner.

use std::io::IsTerminal;

pub const ERROR_FORMAT_ENV: &str = "CF_ERROR_FORMAT";
pub const DEFAULT_ERROR_FORMAT: &str = "cns/acLFEm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSpecifier {
    Arrow,
    Color,
    Function,
    LongExpression,
    LongLocation,
    Message,
    Numbers,
    PrettyFunction,
    Short,
    ShortExpression,
    ShortLocation,
}

impl FormatSpecifier {
    pub const VERBOSE: [FormatSpecifier; 4] = [Self::Arrow, Self::Color, Self::Numbers, Self::Short];
    pub const VERY_VERBOSE: [FormatSpecifier; 7] = [
        Self::Arrow,
        Self::Color,
        Self::Numbers,
        Self::LongLocation,
        Self::PrettyFunction,
        Self::LongExpression,
        Self::Message,
    ];

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'a' => Self::Arrow,
            'c' => Self::Color,
            'f' => Self::Function,
            'E' => Self::LongExpression,
            'L' => Self::LongLocation,
            'm' => Self::Message,
            'n' => Self::Numbers,
            'F' => Self::PrettyFunction,
            's' => Self::Short,
            'e' => Self::ShortExpression,
            'l' => Self::ShortLocation,
            _ => return None,
        })
    }
}

/// Parsed form of a whole-error format string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFormat {
    pub outer: Vec<FormatSpecifier>,
    pub inner: Option<Vec<FormatSpecifier>>,
    pub inner_to_outer: bool,
}

impl ErrorFormat {
    /// Parse a format string. Unknown characters are ignored.
    pub fn parse(spec: &str) -> Self {
        let mut format = ErrorFormat::default();
        for c in spec.chars() {
            let target = match format.inner.as_mut() {
                Some(inner) => inner,
                None => &mut format.outer,
            };
            match c {
                'v' => target.extend(FormatSpecifier::VERBOSE),
                'V' => target.extend(FormatSpecifier::VERY_VERBOSE),
                '/' => {
                    if format.inner.is_none() {
                        format.inner = Some(Vec::new());
                    }
                }
                '^' => format.inner_to_outer = true,
                other => {
                    if let Some(spec) = FormatSpecifier::from_char(other) {
                        target.push(spec);
                    }
                }
            }
        }
        format
    }

    /// Specifiers for the frame at stack position `index` (0 is innermost).
    pub fn specifiers_for(&self, index: usize) -> &[FormatSpecifier] {
        match (&self.inner, index) {
            (Some(inner), 0) => inner,
            _ => &self.outer,
        }
    }
}

/// The format string in effect for this process.
///
/// Honors `CF_ERROR_FORMAT`; a value containing `}` is rejected in favor of
/// `v`. Without color, every `c` specifier is dropped.
pub fn error_format(color: bool) -> String {
    let mut spec = std::env::var(ERROR_FORMAT_ENV).unwrap_or_else(|_| DEFAULT_ERROR_FORMAT.to_string());
    if spec.contains('}') {
        spec = "v".to_string();
    }
    if !color {
        spec.retain(|c| c != 'c');
    }
    spec
}

/// Whether stderr is attached to a terminal.
pub fn stderr_is_terminal() -> bool {
    std::io::stderr().is_terminal()
}

pub(crate) struct Palette {
    pub bold_red: &'static str,
    pub cyan: &'static str,
    pub red: &'static str,
    pub reset: &'static str,
    pub underline: &'static str,
    pub yellow: &'static str,
}

impl Palette {
    pub fn new(color: bool) -> Self {
        if color {
            Self {
                bold_red: "\x1b[0;1;31m",
                cyan: "\x1b[0;36m",
                red: "\x1b[0;31m",
                reset: "\x1b[0m",
                underline: "\x1b[0;4m",
                yellow: "\x1b[0;33m",
            }
        } else {
            Self {
                bold_red: "",
                cyan: "",
                red: "",
                reset: "",
                underline: "",
                yellow: "",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_format() {
        let format = ErrorFormat::parse(DEFAULT_ERROR_FORMAT);
        assert_eq!(
            format.outer,
            vec![FormatSpecifier::Color, FormatSpecifier::Numbers, FormatSpecifier::Short]
        );
        assert_eq!(
            format.inner.as_deref(),
            Some(
                &[
                    FormatSpecifier::Arrow,
                    FormatSpecifier::Color,
                    FormatSpecifier::LongLocation,
                    FormatSpecifier::PrettyFunction,
                    FormatSpecifier::LongExpression,
                    FormatSpecifier::Message,
                ][..]
            )
        );
        assert!(!format.inner_to_outer);
    }

    #[test]
    fn test_parse_presets_and_reverse() {
        let format = ErrorFormat::parse("^v");
        assert!(format.inner_to_outer);
        assert_eq!(format.outer, FormatSpecifier::VERBOSE.to_vec());
        assert!(format.inner.is_none());
    }

    #[test]
    fn test_specifiers_for_innermost() {
        let format = ErrorFormat::parse("s/m");
        assert_eq!(format.specifiers_for(0), &[FormatSpecifier::Message]);
        assert_eq!(format.specifiers_for(1), &[FormatSpecifier::Short]);
    }

    #[test]
    fn test_unknown_characters_ignored() {
        let format = ErrorFormat::parse("xmz");
        assert_eq!(format.outer, vec![FormatSpecifier::Message]);
    }
}
