//! Fixed-size text chunking.
//!
//! Files are split into character windows of `chunk_chars` with
//! `overlap_chars` of trailing context repeated at the start of the next
//! window, so a match near a boundary is still embedded with its
//! surroundings. Offsets are computed on char boundaries, never raw bytes.

/// One window of a source file, ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position of this chunk within the file (0-based, dense).
    pub chunk_index: usize,
    pub text: String,
    /// 1-based line of the first character.
    pub start_line: usize,
    /// 1-based line of the last character. A trailing newline does not
    /// extend the chunk onto the following line.
    pub end_line: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    chunk_chars: usize,
    overlap_chars: usize,
}

impl FileChunker {
    #[must_use]
    pub fn new(chunk_chars: usize, overlap_chars: usize) -> Self {
        let chunk_chars = chunk_chars.max(1);
        Self {
            chunk_chars,
            overlap_chars: overlap_chars.min(chunk_chars - 1),
        }
    }

    /// Split `content` into chunks. Whitespace-only windows are dropped
    /// without consuming an index, so chunk indexes stay dense.
    #[must_use]
    pub fn chunk(&self, content: &str) -> Vec<TextChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        // Byte offset of every char start, plus an end sentinel, so any
        // char-indexed window maps back to a valid subslice.
        let mut offsets: Vec<usize> = content.char_indices().map(|(byte, _)| byte).collect();
        offsets.push(content.len());
        let char_count = offsets.len() - 1;

        let step = self.chunk_chars - self.overlap_chars;
        let mut chunks = Vec::new();
        let mut cursor_char = 0usize;
        let mut cursor_line = 1usize;
        let mut start = 0usize;

        while start < char_count {
            let end = (start + self.chunk_chars).min(char_count);

            // Windows only move forward, so the line counter advances
            // incrementally instead of rescanning from the top.
            cursor_line += count_newlines(&content[offsets[cursor_char]..offsets[start]]);
            cursor_char = start;

            let text = &content[offsets[start]..offsets[end]];
            if !text.trim().is_empty() {
                let newlines = count_newlines(text);
                let trailing = usize::from(text.ends_with('\n') && newlines > 0);
                chunks.push(TextChunk {
                    chunk_index: chunks.len(),
                    text: text.to_string(),
                    start_line: cursor_line,
                    end_line: cursor_line + newlines - trailing,
                });
            }

            if end == char_count {
                break;
            }
            start += step;
        }

        chunks
    }
}

fn count_newlines(text: &str) -> usize {
    text.bytes().filter(|b| *b == b'\n').count()
}
