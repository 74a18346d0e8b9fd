//! Streaming uuencode decoder
//!
//! Much rarer than yEnc on modern servers but still posted by old clients.
//! Each data line carries its decoded length in the first character
//! (`length + 0x20`); groups of four characters decode to three bytes.
//! No CRC exists in the format, so `check` can only confirm that the
//! begin/end pair was seen.

use std::io;

use super::{trim_eol, ArticleSink, DecodeVerdict};

/// Incremental uuencode decoder for one article body
#[derive(Debug, Default)]
pub struct UuDecoder {
    began: bool,
    ended: bool,
    filename: Option<String>,
    broken: bool,
}

impl UuDecoder {
    /// New decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all state, ready for another article
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Decode one body line into the sink
    pub fn write(&mut self, line: &[u8], sink: &mut dyn ArticleSink) -> io::Result<()> {
        let trimmed = trim_eol(line);

        if let Some(rest) = trimmed.strip_prefix(b"begin ") {
            // "begin 644 filename"
            let mut parts = rest.splitn(2, |&b| b == b' ');
            let _mode = parts.next();
            if let Some(name) = parts.next() {
                if !name.is_empty() {
                    self.filename = Some(String::from_utf8_lossy(name).into_owned());
                }
            }
            self.began = true;
            return Ok(());
        }
        if trimmed == b"end" {
            self.ended = true;
            return Ok(());
        }
        if trimmed.is_empty() || trimmed == b"`" {
            // Zero-length line preceding "end"
            self.began = true;
            return Ok(());
        }
        if self.ended {
            return Ok(());
        }

        // Headerless posts start directly with data lines
        self.began = true;

        let len = (trimmed[0].wrapping_sub(0x20) & 0x3f) as usize;
        if len == 0 {
            return Ok(());
        }
        let data = &trimmed[1..];
        let mut out = Vec::with_capacity(len);
        let mut chunks = data.chunks_exact(4);
        for quad in &mut chunks {
            let c: Vec<u8> = quad.iter().map(|&b| b.wrapping_sub(0x20) & 0x3f).collect();
            out.push((c[0] << 2) | (c[1] >> 4));
            out.push((c[1] << 4) | (c[2] >> 2));
            out.push((c[2] << 6) | c[3]);
        }
        if !chunks.remainder().is_empty() {
            self.broken = true;
            return Ok(());
        }
        if out.len() < len {
            self.broken = true;
            return Ok(());
        }
        out.truncate(len);
        sink.write_all(&out)
    }

    /// Verdict after end-of-article
    pub fn check(&self) -> DecodeVerdict {
        if !self.began {
            return DecodeVerdict::NoBinaryData;
        }
        if self.broken {
            return DecodeVerdict::UnknownError;
        }
        if !self.ended {
            return DecodeVerdict::ArticleIncomplete;
        }
        DecodeVerdict::Finished
    }

    /// Filename from the `begin` header, when present
    pub fn article_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }
}
