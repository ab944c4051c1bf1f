//! Structured diagnostics.
//!
//! Messages form a tree: a top-level entry per reported problem, with
//! nested entries for context (candidate lists, parameter details,
//! suggestions). Errors do not abort the pass; they are collected and the
//! pass keeps going where it can.

use core::fmt;

/// Marker for "a diagnostic was already emitted". Carrying no payload
/// keeps the happy path allocation-free and makes double reporting
/// impossible to express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failed;

pub type CResult<T> = Result<T, Failed>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Ice,
    Error,
    Warning,
    Hint,
    Suggest,
    Success,
    Info,
    Trace,
}

impl Level {
    pub const fn prefix(self) -> &'static str {
        match self {
            Level::Ice => "ICE!",
            Level::Error => "error:",
            Level::Warning => "warning:",
            Level::Hint => "hint:",
            Level::Suggest => "suggest:",
            Level::Success => "ok:",
            Level::Info => "info:",
            Level::Trace => "trace:",
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self, Level::Ice | Level::Error)
    }
}

/// Source location attached to a message, taken from the most recent
/// `debugfile`/`debugpos` markers at the point of report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    pub filename: String,
    pub line: u32,
    pub offset: u32,
}

impl Origin {
    pub fn is_known(&self) -> bool {
        !self.filename.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub level: Level,
    pub text: String,
    pub origin: Origin,
    pub entries: Vec<Message>,
}

impl Message {
    pub fn new(level: Level, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            origin: Origin::default(),
            entries: Vec::new(),
        }
    }

    /// Append a child entry and return it for further nesting.
    pub fn entry(&mut self, level: Level, text: impl Into<String>) -> &mut Message {
        self.entries.push(Message::new(level, text));
        self.entries.last_mut().unwrap()
    }

    pub fn hint(&mut self, text: impl Into<String>) -> &mut Message {
        self.entry(Level::Hint, text)
    }

    pub fn suggest(&mut self, text: impl Into<String>) -> &mut Message {
        self.entry(Level::Suggest, text)
    }

    pub fn origin(&mut self, origin: Origin) -> &mut Message {
        self.origin = origin;
        self
    }

    /// Whether this subtree contains an error or an ICE.
    pub fn has_errors(&self) -> bool {
        self.level.is_error() || self.entries.iter().any(Message::has_errors)
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        for _ in 0..depth {
            write!(f, "    ")?;
        }
        write!(f, "{} {}", self.level.prefix(), self.text)?;
        if self.origin.is_known() {
            write!(f, "  [{}:{}]", self.origin.filename, self.origin.line)?;
        }
        writeln!(f)?;
        for entry in &self.entries {
            entry.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

/// Root of the diagnostic tree for one compilation.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub entries: Vec<Message>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, level: Level, text: impl Into<String>) -> &mut Message {
        self.entries.push(Message::new(level, text));
        self.entries.last_mut().unwrap()
    }

    pub fn ice(&mut self, text: impl Into<String>) -> &mut Message {
        self.add(Level::Ice, text)
    }

    pub fn error(&mut self, text: impl Into<String>) -> &mut Message {
        self.add(Level::Error, text)
    }

    pub fn warning(&mut self, text: impl Into<String>) -> &mut Message {
        self.add(Level::Warning, text)
    }

    pub fn hint(&mut self, text: impl Into<String>) -> &mut Message {
        self.add(Level::Hint, text)
    }

    pub fn info(&mut self, text: impl Into<String>) -> &mut Message {
        self.add(Level::Info, text)
    }

    pub fn trace(&mut self, text: impl Into<String>) -> &mut Message {
        self.add(Level::Trace, text)
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(Message::has_errors)
    }

    /// Count of top-level entries at exactly `level`.
    pub fn count(&self, level: Level) -> usize {
        self.entries.iter().filter(|m| m.level == level).count()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            entry.write_indented(f, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_propagates_from_nested_entries() {
        let mut report = Report::new();
        let msg = report.info("instantiating main");
        msg.entry(Level::Error, "unknown identifier 'foo'");
        assert!(report.has_errors());
    }

    #[test]
    fn warnings_alone_are_not_errors() {
        let mut report = Report::new();
        report.warning("unused variable 'x'");
        report.hint("declared here");
        assert!(!report.has_errors());
        assert_eq!(report.count(Level::Warning), 1);
    }

    #[test]
    fn display_indents_children() {
        let mut report = Report::new();
        let msg = report.error("cannot call 'f'");
        msg.hint("candidate 1 not suitable");
        let text = report.to_string();
        assert!(text.starts_with("error: cannot call 'f'"));
        assert!(text.contains("\n    hint: candidate 1 not suitable"));
    }
}
