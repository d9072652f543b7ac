//! Interpretation results and diagnostic rendering
//!
//! Scripts cannot catch errors; a failure aborts the current
//! interpretation and surfaces one diagnostic on the host error stream
//! with the offending line and a short source excerpt, caret underneath.

/// Outcome of interpreting one source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    pub fn is_ok(self) -> bool {
        self == InterpretResult::Ok
    }
}

/// Two-or-three lines of context around `line` (1-based) with a caret
/// underline beneath the offending one.
pub(crate) fn source_excerpt(source: &str, line: u32) -> String {
    let mut out = String::new();
    if line == 0 {
        return out;
    }

    let lines: Vec<&str> = source.lines().collect();
    let index = line as usize - 1;
    if index >= lines.len() {
        return out;
    }

    if index > 0 {
        out.push_str(&format!("{:4} | {}\n", line - 1, lines[index - 1]));
    }
    let text = lines[index];
    out.push_str(&format!("{line:4} | {text}\n"));

    let leading = text.len() - text.trim_start().len();
    let width = text.trim_end().len().saturating_sub(leading).max(1);
    out.push_str(&format!(
        "     | {}{}\n",
        " ".repeat(leading),
        "^".repeat(width)
    ));
    out
}

/// `[line N] Error at 'x': message` in the classic shape. `at` is the
/// token text, empty when the scanner already put the message in the
/// token, or "end" at EOF.
pub(crate) fn compile_error_header(line: u32, at: &str, message: &str) -> String {
    if at.is_empty() {
        format!("[line {line}] Error: {message}")
    } else {
        format!("[line {line}] Error at '{at}': {message}")
    }
}

pub(crate) fn runtime_error_report(
    message: &str,
    line: u32,
    module: &str,
    source: &str,
) -> String {
    let mut out = format!("{message}\n[line {line}] in module '{module}'\n");
    out.push_str(&source_excerpt(source, line));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_points_at_the_line() {
        let source = "var a = 1\nvar b = oops\nvar c = 3\n";
        let excerpt = source_excerpt(source, 2);
        assert!(excerpt.contains("   1 | var a = 1"));
        assert!(excerpt.contains("   2 | var b = oops"));
        assert!(excerpt.contains("^^^^"));
        assert!(!excerpt.contains("var c"));
    }

    #[test]
    fn excerpt_tolerates_out_of_range_lines() {
        assert_eq!(source_excerpt("one line", 7), "");
        assert_eq!(source_excerpt("one line", 0), "");
    }

    #[test]
    fn header_formats() {
        assert_eq!(
            compile_error_header(3, "then", "Expect expression."),
            "[line 3] Error at 'then': Expect expression."
        );
        assert_eq!(
            compile_error_header(1, "", "Unterminated string."),
            "[line 1] Error: Unterminated string."
        );
    }
}
