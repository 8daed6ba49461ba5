// ABOUTME: Helpers for bounding guest output: traceback trimming and NDJSON line framing
// ABOUTME: Keeps every payload handed back to callers within a fixed budget

/// Keep the first line of a traceback and its last `max_lines` lines.
pub fn trim_traceback(traceback: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = traceback.lines().collect();
    if lines.len() <= max_lines.saturating_add(1) {
        return traceback.trim_end().to_string();
    }
    let tail = &lines[lines.len() - max_lines..];
    let omitted = lines.len() - max_lines - 1;
    let mut out = String::from(lines[0]);
    out.push_str(&format!("\n  ... {} lines omitted ...", omitted));
    for line in tail {
        out.push('\n');
        out.push_str(line);
    }
    out
}

/// Reassembles complete lines from arbitrarily split byte chunks.
///
/// A single line longer than `max_line_bytes` is cut and emitted in pieces so
/// a guest that never writes a newline cannot grow the buffer without bound.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    max_line_bytes: usize,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        while self.buf.len() > self.max_line_bytes {
            let piece: Vec<u8> = self.buf.drain(..self.max_line_bytes).collect();
            lines.push(String::from_utf8_lossy(&piece).into_owned());
        }
        lines
    }

    /// Whatever trailing text never saw a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_traceback_untouched() {
        let tb = "Traceback (most recent call last):\n  File \"<cell>\", line 1\nValueError: x\n";
        assert_eq!(trim_traceback(tb, 10), tb.trim_end());
    }

    #[test]
    fn test_long_traceback_keeps_header_and_tail() {
        let mut tb = String::from("Traceback (most recent call last):\n");
        for i in 0..50 {
            tb.push_str(&format!("  frame {}\n", i));
        }
        tb.push_str("RecursionError: too deep\n");

        let trimmed = trim_traceback(&tb, 5);
        let lines: Vec<&str> = trimmed.lines().collect();
        assert_eq!(lines[0], "Traceback (most recent call last):");
        assert_eq!(lines[1], "  ... 46 lines omitted ...");
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[6], "RecursionError: too deep");
    }

    #[test]
    fn test_splitter_joins_partial_chunks() {
        let mut splitter = LineSplitter::new(1024);
        assert!(splitter.push(b"{\"type\":").is_empty());
        let lines = splitter.push(b"\"status\"}\nplain out");
        assert_eq!(lines, vec!["{\"type\":\"status\"}".to_string()]);
        assert_eq!(splitter.finish().as_deref(), Some("plain out"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_bounds_runaway_lines() {
        let mut splitter = LineSplitter::new(4);
        let lines = splitter.push(b"abcdefghij");
        assert_eq!(lines, vec!["abcd".to_string(), "efgh".to_string()]);
        assert_eq!(splitter.finish().as_deref(), Some("ij"));
    }
}
