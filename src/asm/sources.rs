//! Byte-level sources that the lexer reads from.
//!
//! Regular files are read whole and shared as a [`ViewedContent`]; standard input
//! (and anything else we cannot slurp up front) goes through a [`BufferedContent`],
//! a fixed-size ring buffer that refills lazily.

use std::{fmt::Debug, fs::File, io::Read, rc::Rc};

use crate::diagnostics;

/// How many bytes a [`BufferedContent`] retains at most.
pub const LEXER_BUF_SIZE: usize = 64 * 1024;

/// A window into a shared, immutable byte buffer.
///
/// Cloning is cheap, and clones keep the underlying buffer alive; this is what lets
/// captured macro and loop bodies outlive the context they were captured from.
#[derive(Debug, Clone)]
pub struct ContentSpan {
    bytes: Rc<[u8]>,
    offset: usize,
    size: usize,
}

impl ContentSpan {
    pub fn new(bytes: Rc<[u8]>) -> Self {
        let size = bytes.len();
        Self {
            bytes,
            offset: 0,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, idx: usize) -> Option<u8> {
        (idx < self.size).then(|| self.bytes[self.offset + idx])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.size]
    }

    /// Shrinks the window from the right.
    pub fn shrink_by(&mut self, nb_bytes: usize) {
        debug_assert!(nb_bytes <= self.size);
        self.size -= nb_bytes;
    }

    pub(crate) fn resize(&mut self, size: usize) {
        debug_assert!(self.offset + size <= self.bytes.len());
        self.size = size;
    }

    fn sub_window(&self, offset: usize, size: usize) -> Self {
        debug_assert!(offset + size <= self.size);
        Self {
            bytes: Rc::clone(&self.bytes),
            offset: self.offset + offset,
            size,
        }
    }
}

impl From<Vec<u8>> for ContentSpan {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes.into())
    }
}

/// A fully-loaded source. The read offset lives here; the bytes are shared.
#[derive(Debug)]
pub struct ViewedContent {
    pub span: ContentSpan,
    pub offset: usize,
}

impl ViewedContent {
    pub fn new(span: ContentSpan) -> Self {
        Self { span, offset: 0 }
    }

    fn peek(&self, distance: usize) -> Option<u8> {
        self.span.get(self.offset + distance)
    }

    fn advance(&mut self) {
        if self.offset < self.span.len() {
            self.offset += 1;
        }
    }

    /// An empty window anchored at the read cursor, sharing the same buffer.
    pub fn window_at_cursor(&self) -> ContentSpan {
        self.span.sub_window(self.offset, 0)
    }
}

/// A source streamed through a ring buffer, for file descriptors we cannot
/// (or should not) read whole, like standard input.
pub struct BufferedContent {
    reader: Box<dyn Read>,
    buf: Box<[u8; LEXER_BUF_SIZE]>,
    /// Index of the first valid byte.
    offset: usize,
    /// Number of valid bytes.
    len: usize,
}

impl BufferedContent {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self {
            reader,
            buf: Box::new([0; LEXER_BUF_SIZE]),
            offset: 0,
            len: 0,
        }
    }

    fn peek(&mut self, distance: usize, path: &str) -> Option<u8> {
        debug_assert!(distance < LEXER_BUF_SIZE);
        if self.len <= distance {
            self.refill(path);
        }
        (self.len > distance).then(|| self.buf[(self.offset + distance) % LEXER_BUF_SIZE])
    }

    fn advance(&mut self) {
        self.offset += 1;
        if self.offset == LEXER_BUF_SIZE {
            self.offset = 0; // Wrap around.
        }
        self.len = self.len.saturating_sub(1);
    }

    fn refill(&mut self, path: &str) {
        let mut target = LEXER_BUF_SIZE - self.len; // Aim: filling the buffer.
        let mut start_idx = (self.offset + self.len) % LEXER_BUF_SIZE;

        // If the range to fill wraps around the buffer's end, two reads are needed.
        if start_idx + target > LEXER_BUF_SIZE {
            let nb_expected = LEXER_BUF_SIZE - start_idx;
            let nb_read = self.read_more(start_idx, nb_expected, path);

            start_idx = (start_idx + nb_read) % LEXER_BUF_SIZE;
            target -= nb_read;
            if nb_read < nb_expected {
                // The read came up short, don't attempt a second one.
                target = 0;
            }
        }
        if target != 0 {
            self.read_more(start_idx, target, path);
        }
    }

    fn read_more(&mut self, start_idx: usize, nb_bytes: usize, path: &str) -> usize {
        debug_assert!(start_idx + nb_bytes <= LEXER_BUF_SIZE);
        match self.reader.read(&mut self.buf[start_idx..start_idx + nb_bytes]) {
            Ok(nb_read) => {
                self.len += nb_read;
                nb_read
            }
            Err(err) => diagnostics::fatal(None, format!("Error while reading \"{path}\": {err}")),
        }
    }
}

impl Debug for BufferedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedContent")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Content {
    Viewed(ViewedContent),
    Buffered(BufferedContent),
}

impl Content {
    pub fn from_file(mut file: File) -> std::io::Result<Self> {
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(Self::Viewed(ViewedContent::new(bytes.into())))
    }

    pub fn from_stdin() -> Self {
        Self::Buffered(BufferedContent::new(Box::new(std::io::stdin())))
    }

    /// Peek at `distance` bytes past the read cursor. Only distances 0 and 1 are
    /// ever needed (the latter for macro-arg introducers).
    pub fn peek(&mut self, distance: usize, path: &str) -> Option<u8> {
        match self {
            Self::Viewed(view) => view.peek(distance),
            Self::Buffered(cbuf) => cbuf.peek(distance, path),
        }
    }

    /// Advance the read cursor by one byte; a no-op past the end.
    pub fn advance(&mut self) {
        match self {
            Self::Viewed(view) => view.advance(),
            Self::Buffered(cbuf) => cbuf.advance(),
        }
    }
}
