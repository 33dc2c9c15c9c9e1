//! Tidying and classification of copy-tool output lines.
//!
//! Copy tools redraw their progress display with carriage returns and ANSI
//! cursor movements. Lines are stripped of both before they are inspected or
//! logged, so the log file reads like a plain transcript.

/// How a tool reports trouble in its output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClassifier {
    /// Any line mentioning "error" (case-insensitive) marks the copy as
    /// failed. Used for `dd` and `readom`.
    ErrorKeyword,
    /// The tool keeps a running `errors:` tally in its status block; a
    /// non-zero final tally marks the copy as failed. Used for `ddrescue`.
    RescueErrorCount,
}

/// Running classification state for one tool invocation.
#[derive(Debug, Clone)]
pub struct StreamClassifier {
    kind: LineClassifier,
    keyword_seen: bool,
    error_count: Option<u64>,
}

impl StreamClassifier {
    pub fn new(kind: LineClassifier) -> Self {
        Self {
            kind,
            keyword_seen: false,
            error_count: None,
        }
    }

    /// Tidies one raw line and updates the classification. Returns the tidied
    /// line, or `None` if nothing is left after tidying.
    pub fn classify(&mut self, raw: &str) -> Option<String> {
        let line = tidy_line(raw);
        if line.is_empty() {
            return None;
        }

        match self.kind {
            LineClassifier::ErrorKeyword => {
                if line.to_lowercase().contains("error") {
                    self.keyword_seen = true;
                }
            }
            LineClassifier::RescueErrorCount => {
                if let Some(count) = parse_error_count(&line) {
                    self.error_count = Some(count);
                }
            }
        }

        Some(line)
    }

    pub fn error_detected(&self) -> bool {
        match self.kind {
            LineClassifier::ErrorKeyword => self.keyword_seen,
            LineClassifier::RescueErrorCount => self.error_count.is_some_and(|n| n != 0),
        }
    }

    /// The last error tally reported by a rescue-style tool, if any.
    pub fn error_count(&self) -> Option<u64> {
        self.error_count
    }
}

/// Removes line terminators, carriage returns and ANSI CSI sequences
/// (`ESC [ params final`), which is how cursor repositioning is encoded.
pub fn tidy_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' | '\r' => {}
            '\x1b' if chars.peek() == Some(&'[') => {
                chars.next();
                // Parameter and intermediate bytes run until a final byte in '@'..='~'.
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Extracts the value of an `errors:` field from a comma-separated status
/// line. The field was renamed from `errors:` to `read errors:` across tool
/// versions; both forms match. Returns `None` if the line has no such field
/// or its value is not a number.
pub fn parse_error_count(line: &str) -> Option<u64> {
    line.split(',')
        .filter(|item| item.contains("errors:"))
        .filter_map(|item| item.split(':').nth(1))
        .filter_map(|value| value.trim().parse::<u64>().ok())
        .last()
}
