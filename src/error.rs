use crate::token::Span;

/// Callback invoked once per compilation error, mirroring the embedding
/// API shape: start line/column, end line/column, message.
pub type ErrorCallback = Box<dyn FnMut(i32, i32, i32, i32, &str)>;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub span: Span,
    pub message: String,
}

impl Diagnostic {
    /// Renders the diagnostic against its source line with a caret
    /// underline, for hosts that want a plain-text report.
    pub fn display_with_source(&self, source: &str) -> String {
        let line_no = self.span.start_line.max(1) as usize;
        let line = source.lines().nth(line_no - 1).unwrap_or("");
        let col = (self.span.start_col.max(1) - 1) as usize;
        let len = if self.span.end_line == self.span.start_line {
            ((self.span.end_col - self.span.start_col).max(1)) as usize
        } else {
            1
        };
        let underline = format!("{}{}", " ".repeat(col.min(line.len())), "^".repeat(len));
        format!(
            "error: {}\n\n{:4} | {}\n     | {}",
            self.message, line_no, line, underline
        )
    }
}

/// Collects compilation errors and forwards them to the host callback.
///
/// Errors never abort; they set a fatal flag that blocks code generation
/// once the front end finishes.
#[derive(Default)]
pub struct Diagnostics {
    diagnostics: Vec<Diagnostic>,
    callback: Option<ErrorCallback>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&mut self, callback: ErrorCallback) {
        self.callback = Some(callback);
    }

    pub fn report(&mut self, span: Span, message: impl Into<String>) {
        let message = message.into();
        if let Some(callback) = self.callback.as_mut() {
            callback(
                span.start_line,
                span.start_col,
                span.end_line,
                span.end_col,
                &message,
            );
        }
        self.diagnostics.push(Diagnostic { span, message });
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn clear(&mut self) {
        self.diagnostics.clear();
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_sets_fatal_state() {
        let mut diagnostics = Diagnostics::new();
        assert!(!diagnostics.has_errors());
        diagnostics.report(Span::new(1, 1, 1, 2), "Unexpected character");
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.diagnostics().len(), 1);
    }

    #[test]
    fn report_invokes_callback_with_span() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen: Rc<RefCell<Vec<(i32, i32, String)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();

        let mut diagnostics = Diagnostics::new();
        diagnostics.set_callback(Box::new(move |sl, sc, _el, _ec, message| {
            sink.borrow_mut().push((sl, sc, message.to_string()));
        }));

        diagnostics.report(Span::new(3, 7, 3, 9), "Type mismatch.");
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (3, 7, "Type mismatch.".to_string()));
    }

    #[test]
    fn display_with_source_shows_line_and_underline() {
        let diagnostic = Diagnostic {
            span: Span::new(1, 5, 1, 11),
            message: "Unterminated string".to_string(),
        };
        let display = diagnostic.display_with_source("a = \"oops");
        assert!(display.contains("\"oops"), "source line missing: {}", display);
        assert!(display.contains("^^^^^^"), "underline missing: {}", display);
    }
}
