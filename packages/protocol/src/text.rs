// ABOUTME: Bounded text capture for stdout/stderr tails
// ABOUTME: Keeps only the last N characters of a stream and reports how much was dropped

/// Keep the last `max_chars` characters of `text`, prefixing a marker when
/// anything was dropped.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let omitted = total - max_chars;
    let start = text
        .char_indices()
        .nth(omitted)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    format!("[... {} characters truncated ...]\n{}", omitted, &text[start..])
}

/// Streaming tail buffer. Memory stays bounded to roughly twice the budget
/// no matter how much is pushed.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    max_chars: usize,
    buf: String,
    dropped: usize,
}

impl TailBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            buf: String::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        let len = self.buf.chars().count();
        if len > self.max_chars.saturating_mul(2).max(1024) {
            let excess = len - self.max_chars;
            let cut = self
                .buf
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.buf.len());
            self.buf.drain(..cut);
            self.dropped += excess;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.dropped == 0
    }

    /// Final tail, never longer than the budget plus the truncation marker.
    pub fn finish(&self) -> String {
        let len = self.buf.chars().count();
        let excess = len.saturating_sub(self.max_chars);
        let omitted = self.dropped + excess;
        if omitted == 0 {
            return self.buf.clone();
        }
        let start = self
            .buf
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(self.buf.len());
        format!(
            "[... {} characters truncated ...]\n{}",
            omitted,
            &self.buf[start..]
        )
    }
}
