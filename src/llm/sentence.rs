//! Sentence-level chunking of a token stream.
//!
//! Tokens are appended to a buffer; after each one the buffer is scanned
//! for a boundary: `.`, `!` or `?` followed by whitespace or by the end of
//! the buffer, where the text up to and including the punctuation is at
//! least `min_chars` long once trimmed.  Everything up to the boundary
//! (plus the whitespace run after it) is cut off and returned; the rest
//! stays buffered.
//!
//! Returned segments are raw, so concatenating every segment and the final
//! remainder reproduces the token stream exactly.  Callers trim before
//! display or synthesis.

const TERMINATORS: [char; 3] = ['.', '!', '?'];

/// `true` if `text` contains a boundary under the rules above.
pub fn is_sentence_boundary(text: &str, min_chars: usize) -> bool {
    find_boundary(text, min_chars).is_some()
}

/// Byte offset just past the first qualifying boundary, including the
/// whitespace run that follows it.
fn find_boundary(text: &str, min_chars: usize) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !TERMINATORS.contains(&c) {
            continue;
        }
        let punct_end = i + c.len_utf8();
        let followed_ok = match chars.peek() {
            None => true,
            Some(&(_, next)) => next.is_whitespace(),
        };
        if !followed_ok {
            continue;
        }
        if text[..punct_end].trim().chars().count() < min_chars {
            continue;
        }
        let rest = &text[punct_end..];
        let ws = rest.len() - rest.trim_start().len();
        return Some(punct_end + ws);
    }
    None
}

/// Incremental splitter; see the module docs.
#[derive(Debug, Clone)]
pub struct SentenceChunker {
    buffer: String,
    min_chars: usize,
}

impl SentenceChunker {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
        }
    }

    /// Append a token and return every raw segment it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut segments = Vec::new();
        while let Some(end) = find_boundary(&self.buffer, self.min_chars) {
            let rest = self.buffer.split_off(end);
            segments.push(std::mem::replace(&mut self.buffer, rest));
        }
        segments
    }

    /// Take whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
