//! Builder-pattern printer for rendering errors against the source text.

use std::fmt::Write;

use annotate_snippets::{AnnotationKind, Group, Level, Renderer, Snippet};

use crate::error::{canonical_error_strings, Error, Severity};

/// Builder for rendering a list of errors with various options.
///
/// With a source text, errors are rendered as annotated snippets; without
/// one, the canonical one-line error strings are used.
pub struct ErrorPrinter<'e, 's> {
    errors: &'e [Error],
    source: Option<&'s str>,
    path: Option<&'s str>,
    colored: bool,
}

impl<'e, 's> ErrorPrinter<'e, 's> {
    pub fn new(errors: &'e [Error]) -> Self {
        Self {
            errors,
            source: None,
            path: None,
            colored: false,
        }
    }

    pub fn source(mut self, source: &'s str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn path(mut self, path: &'s str) -> Self {
        self.path = Some(path);
        self
    }

    pub fn colored(mut self, value: bool) -> Self {
        self.colored = value;
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.format(&mut out).expect("String write never fails");
        out
    }

    pub fn format(&self, w: &mut impl Write) -> std::fmt::Result {
        let Some(source) = self.source else {
            return self.format_plain(w);
        };

        if self.errors.is_empty() {
            return Ok(());
        }

        let renderer = if self.colored {
            Renderer::styled()
        } else {
            Renderer::plain()
        };

        for (i, err) in self.errors.iter().enumerate() {
            let range = annotation_range(err.pos(), err.length, source.len());

            let mut snippet = Snippet::source(source).line_start(1).annotation(
                AnnotationKind::Primary
                    .span(range)
                    .label(&err.message),
            );

            if let Some(p) = self.path {
                snippet = snippet.path(p);
            }

            for related in &err.related {
                snippet = snippet.annotation(
                    AnnotationKind::Context
                        .span(annotation_range(related.pos(), related.length, source.len()))
                        .label(&related.message),
                );
            }

            let level = severity_to_level(err.severity());
            let title_group = level.primary_title(&err.message).element(snippet);
            let report: Vec<Group> = vec![title_group];

            if i > 0 {
                w.write_char('\n')?;
            }
            write!(w, "{}", renderer.render(&report))?;
        }

        Ok(())
    }

    fn format_plain(&self, w: &mut impl Write) -> std::fmt::Result {
        for (i, line) in canonical_error_strings(self.errors).iter().enumerate() {
            if i > 0 {
                w.write_char('\n')?;
            }
            w.write_str(line)?;
        }
        Ok(())
    }
}

fn severity_to_level(severity: Severity) -> Level<'static> {
    match severity {
        Severity::Notice => Level::NOTE,
        Severity::Warning => Level::WARNING,
        Severity::Error | Severity::Fatal => Level::ERROR,
    }
}

fn annotation_range(pos: usize, length: usize, limit: usize) -> std::ops::Range<usize> {
    let start = pos.min(limit.saturating_sub(1));
    let end = (pos + length.max(1)).min(limit);
    start..end.max(start + 1).min(limit.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ERROR, WARNING};

    #[test]
    fn plain_rendering_without_source() {
        let errors = vec![
            Error::new("first problem", 0, ERROR),
            Error::new("second problem", 4, WARNING),
        ];
        let rendered = ErrorPrinter::new(&errors).render();
        assert_eq!(
            rendered,
            "Error (1000): first problem\nWarning (100): second problem"
        );
    }

    #[test]
    fn snippet_rendering_includes_message_and_marker() {
        let errors = vec![Error::new("unexpected token", 4, ERROR).with_length(3)];
        let rendered = ErrorPrinter::new(&errors)
            .source("abc defg hi")
            .path("doc.dsl")
            .render();
        assert!(rendered.contains("unexpected token"));
        assert!(rendered.contains("doc.dsl"));
        assert!(rendered.contains("^^^"));
    }

    #[test]
    fn empty_error_list_renders_nothing() {
        let rendered = ErrorPrinter::new(&[]).source("text").render();
        assert!(rendered.is_empty());
    }
}
