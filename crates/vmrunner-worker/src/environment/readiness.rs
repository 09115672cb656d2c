// Classifies VM boot output into operator-facing lines and internal diagnostics.

use vmrunner_common::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDisposition {
    /// Show in the job's live log.
    Forward,
    /// Diagnostics only.
    Suppress,
}

/// Once a line containing the marker is seen, that line and everything
/// after it are suppressed. The stream is still read to the end.
#[derive(Debug, Clone)]
pub struct ReadinessScanner {
    marker: String,
    ready: bool,
}

impl ReadinessScanner {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            ready: false,
        }
    }

    pub fn observe(&mut self, line: &str) -> LineDisposition {
        if !self.ready && line.contains(self.marker.as_str()) {
            self.ready = true;
        }
        if self.ready {
            LineDisposition::Suppress
        } else {
            LineDisposition::Forward
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

impl Default for ReadinessScanner {
    fn default() -> Self {
        Self::new(constants::vm::READINESS_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded<'a>(lines: &[&'a str]) -> Vec<&'a str> {
        let mut scanner = ReadinessScanner::default();
        lines
            .iter()
            .copied()
            .filter(|line| scanner.observe(line) == LineDisposition::Forward)
            .collect()
    }

    #[test]
    fn lines_before_marker_forwarded() {
        assert_eq!(forwarded(&["booting", "DEBUG START", "internal"]), vec!["booting"]);
    }

    #[test]
    fn marker_inside_line_counts() {
        let mut scanner = ReadinessScanner::default();
        assert_eq!(scanner.observe("[qemu] DEBUG START 12:00"), LineDisposition::Suppress);
        assert!(scanner.is_ready());
        assert_eq!(scanner.observe("login: ok"), LineDisposition::Suppress);
    }

    #[test]
    fn no_marker_forwards_everything() {
        let lines = ["a", "b", "c"];
        assert_eq!(forwarded(&lines), lines.to_vec());
    }

    #[test]
    fn marker_is_case_sensitive() {
        assert_eq!(forwarded(&["debug start", "x"]), vec!["debug start", "x"]);
    }
}
