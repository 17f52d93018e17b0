//! A single frame of a [`StackTraceError`](super::StackTraceError).

use super::format::{FormatSpecifier, Palette};

/// One propagation site: where an error crossed a boundary and why.
///
/// Frames are captured by the propagation macros (`propagate!`, `ensure!`,
/// `stack_err!`, ...) and carry the source location, the enclosing function,
/// the checked expression (if any) and a free-form message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceEntry {
    file: &'static str,
    line: u32,
    function_path: &'static str,
    origin: &'static str,
    expression: &'static str,
    message: String,
}

impl StackTraceEntry {
    /// Create a frame for `file:line` inside the function at `function_path`.
    pub fn new(file: &'static str, line: u32, function_path: &'static str) -> Self {
        Self {
            file,
            line,
            function_path,
            origin: "",
            expression: "",
            message: String::new(),
        }
    }

    /// Attach the expression text checked by macro `origin` (e.g. `ensure`).
    pub fn with_expression(mut self, origin: &'static str, expression: &'static str) -> Self {
        self.origin = origin;
        self.expression = expression;
        self
    }

    /// Append text to this frame's message.
    pub fn with_message(mut self, message: impl AsRef<str>) -> Self {
        self.message.push_str(message.as_ref());
        self
    }

    pub(crate) fn fill_message(&mut self, message: &str) {
        if self.message.is_empty() {
            self.message.push_str(message);
        }
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn expression(&self) -> &'static str {
        self.expression
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn has_message(&self) -> bool {
        !self.message.is_empty()
    }

    /// Fully-qualified path of the enclosing function.
    pub fn pretty_function(&self) -> &'static str {
        self.function_path
    }

    /// Enclosing function name without its module path or closure suffixes.
    pub fn function(&self) -> &'static str {
        self.function_path
            .rsplit("::")
            .find(|segment| *segment != "{{closure}}")
            .unwrap_or(self.function_path)
    }

    /// File basename.
    pub fn short_file(&self) -> &'static str {
        self.file.rsplit('/').next().unwrap_or(self.file)
    }

    /// Render this frame with `specifiers`.
    ///
    /// `a`, `c` and `n` change every rendered line; every other specifier
    /// renders one line. Expression and message specifiers are skipped when
    /// the frame has no such field, and an empty list falls back to `s`.
    pub fn render(&self, specifiers: &[FormatSpecifier], index: Option<usize>) -> String {
        let mut arrow = false;
        let mut color = false;
        let mut numbers = false;
        let mut lines = Vec::new();
        for spec in specifiers {
            match spec {
                FormatSpecifier::Arrow => arrow = true,
                FormatSpecifier::Color => color = true,
                FormatSpecifier::Numbers => numbers = true,
                FormatSpecifier::LongExpression | FormatSpecifier::ShortExpression
                    if self.expression.is_empty() => {}
                FormatSpecifier::Message if !self.has_message() => {}
                other => lines.push(*other),
            }
        }
        if lines.is_empty() {
            lines.push(FormatSpecifier::Short);
        }

        let palette = Palette::new(color);
        let mut out = String::new();
        let count = lines.len();
        for (i, spec) in lines.iter().enumerate() {
            if let (Some(index), true) = (index, numbers) {
                out.push_str(&format!("{}{}{}. ", palette.yellow, index, palette.reset));
            }
            out.push_str(palette.red);
            if arrow && i + 2 < count {
                out.push_str(if numbers { "|  " } else { " | " });
            } else if arrow && i + 2 == count {
                out.push_str(if numbers { "v  " } else { " v " });
            }
            out.push_str(palette.reset);
            self.render_line(*spec, &palette, &mut out);
            if i + 1 < count {
                out.push('\n');
            }
        }
        out
    }

    fn render_line(&self, spec: FormatSpecifier, p: &Palette, out: &mut String) {
        let line = match spec {
            FormatSpecifier::Function => format!("{}{}{}", p.cyan, self.function(), p.reset),
            FormatSpecifier::LongExpression => format!("{}!({})", self.origin, self.expression),
            FormatSpecifier::ShortExpression => self.expression.to_string(),
            FormatSpecifier::LongLocation => format!(
                "{}{}{}:{}{}{}",
                p.underline, self.file, p.reset, p.yellow, self.line, p.reset
            ),
            FormatSpecifier::ShortLocation => format!(
                "{}{}{}:{}{}{}",
                p.underline,
                self.short_file(),
                p.reset,
                p.yellow,
                self.line,
                p.reset
            ),
            FormatSpecifier::Message => format!("{}{}{}", p.bold_red, self.message, p.reset),
            FormatSpecifier::PrettyFunction => {
                format!("{}{}{}", p.cyan, self.function_path, p.reset)
            }
            FormatSpecifier::Short => {
                let last = if self.has_message() {
                    format!("{}{}{}", p.bold_red, self.message, p.reset)
                } else {
                    String::new()
                };
                format!(
                    "{}{}{}:{}{}{} | {}{}{} | {}",
                    p.underline,
                    self.short_file(),
                    p.reset,
                    p.yellow,
                    self.line,
                    p.reset,
                    p.cyan,
                    self.function(),
                    p.reset,
                    last
                )
            }
            FormatSpecifier::Arrow | FormatSpecifier::Color | FormatSpecifier::Numbers => {
                String::new()
            }
        };
        out.push_str(&line);
    }
}
