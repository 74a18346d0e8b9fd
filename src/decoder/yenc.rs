//! Streaming yEnc decoder
//!
//! Decodes one body line at a time: `=ybegin` and `=ypart` headers select
//! the destination offset (direct-write mode seeks the sink), data lines
//! are unescaped and shifted by the yEnc offset, and `=yend` closes the
//! part and carries the expected size and CRC32.

use std::io;

use super::{trim_eol, ArticleSink, DecodeVerdict};

/// yEnc shift applied to every encoded byte
const YENC_OFFSET: u8 = 42;
/// Additional shift applied to escaped bytes
const YENC_ESCAPE_OFFSET: u8 = 64;

/// Incremental yEnc decoder for one article body
#[derive(Debug)]
pub struct YencDecoder {
    /// `=ybegin` seen
    began: bool,
    /// `=yend` seen
    ended: bool,
    /// Seek the sink to the part offset declared by `=ybegin`/`=ypart`
    auto_seek: bool,
    /// Seek is still pending for the next data byte
    need_set_pos: bool,
    /// Verify the trailer CRC
    crc_check: bool,
    crc: crc32fast::Hasher,
    /// CRC from `pcrc32=` (or `crc32=` for single-part posts)
    expected_crc: Option<u32>,
    /// 1-based inclusive part range from `=ypart`
    part_begin: Option<u64>,
    part_end: Option<u64>,
    /// `size=` from `=ybegin` (total destination file size)
    file_size: Option<u64>,
    /// `size=` from `=yend`
    end_size: Option<u64>,
    /// Decoded bytes written so far
    written: u64,
    /// `name=` from `=ybegin`
    filename: Option<String>,
    /// A data line failed to decode
    broken: bool,
    /// Carry for an escape byte split across the line ending (never valid
    /// yEnc, kept to avoid panicking on garbage)
    pending_escape: bool,
}

impl YencDecoder {
    /// New decoder; `auto_seek` enables direct-write positioning
    pub fn new(auto_seek: bool, crc_check: bool) -> Self {
        Self {
            began: false,
            ended: false,
            auto_seek,
            need_set_pos: auto_seek,
            crc_check,
            crc: crc32fast::Hasher::new(),
            expected_crc: None,
            part_begin: None,
            part_end: None,
            file_size: None,
            end_size: None,
            written: 0,
            filename: None,
            broken: false,
            pending_escape: false,
        }
    }

    /// Forget all state, ready for another article
    pub fn reset(&mut self) {
        *self = Self::new(self.auto_seek, self.crc_check);
    }

    /// Decode one body line into the sink
    pub fn write(&mut self, line: &[u8], sink: &mut dyn ArticleSink) -> io::Result<()> {
        if line.starts_with(b"=ybegin ") {
            self.began = true;
            self.file_size = attr_u64(line, b" size=");
            self.filename = attr_str(line, b" name=");
            // Single-part posts have no =ypart; the body starts at offset 0.
            if self.auto_seek && self.need_set_pos && attr_u64(line, b" part=").is_none() {
                sink.seek_to(0)?;
                self.need_set_pos = false;
            }
            return Ok(());
        }
        if line.starts_with(b"=ypart ") {
            self.part_begin = attr_u64(line, b" begin=");
            self.part_end = attr_u64(line, b" end=");
            if self.auto_seek && self.need_set_pos {
                // begin= is 1-based
                let offset = self.part_begin.unwrap_or(1).saturating_sub(1);
                sink.seek_to(offset)?;
                self.need_set_pos = false;
            }
            return Ok(());
        }
        if line.starts_with(b"=yend ") {
            self.ended = true;
            self.end_size = attr_u64(line, b" size=");
            self.expected_crc = attr_hex(line, b" pcrc32=").or_else(|| {
                if self.part_begin.is_none() {
                    attr_hex(line, b" crc32=")
                } else {
                    None
                }
            });
            return Ok(());
        }
        if !self.began || self.ended {
            // Junk before =ybegin or after =yend is ignored
            return Ok(());
        }

        let mut decoded = [0u8; 1024];
        let mut n = 0usize;
        for &byte in trim_eol(line) {
            let raw = if self.pending_escape {
                self.pending_escape = false;
                byte.wrapping_sub(YENC_ESCAPE_OFFSET)
                    .wrapping_sub(YENC_OFFSET)
            } else if byte == b'=' {
                self.pending_escape = true;
                continue;
            } else {
                byte.wrapping_sub(YENC_OFFSET)
            };
            if n == decoded.len() {
                self.flush(&decoded[..n], sink)?;
                n = 0;
            }
            decoded[n] = raw;
            n += 1;
        }
        if self.pending_escape {
            // '=' as the last byte of a line: broken encoding
            self.pending_escape = false;
            self.broken = true;
        }
        self.flush(&decoded[..n], sink)
    }

    fn flush(&mut self, bytes: &[u8], sink: &mut dyn ArticleSink) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.crc_check {
            self.crc.update(bytes);
        }
        self.written += bytes.len() as u64;
        sink.write_all(bytes)
    }

    /// Verdict after end-of-article
    pub fn check(&self) -> DecodeVerdict {
        if !self.began {
            return DecodeVerdict::NoBinaryData;
        }
        if !self.ended {
            return DecodeVerdict::ArticleIncomplete;
        }
        if self.broken {
            return DecodeVerdict::UnknownError;
        }
        if let (Some(begin), Some(end)) = (self.part_begin, self.part_end) {
            if end < begin || end - begin + 1 != self.written {
                return DecodeVerdict::InvalidSize;
            }
        }
        if let Some(expected) = self.end_size {
            if expected != self.written {
                return DecodeVerdict::InvalidSize;
            }
        }
        if self.crc_check {
            if let Some(expected) = self.expected_crc {
                if self.crc.clone().finalize() != expected {
                    return DecodeVerdict::CrcError;
                }
            }
        }
        DecodeVerdict::Finished
    }

    /// `name=` from `=ybegin`, when present
    pub fn article_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// `size=` from `=ybegin`: the total size of the destination file
    pub fn declared_file_size(&self) -> Option<u64> {
        self.file_size
    }
}

/// Extract a decimal attribute like ` size=12345`
fn attr_u64(line: &[u8], key: &[u8]) -> Option<u64> {
    let start = find(line, key)? + key.len();
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}

/// Extract a hex attribute like ` pcrc32=a1b2c3d4`
fn attr_hex(line: &[u8], key: &[u8]) -> Option<u32> {
    let start = find(line, key)? + key.len();
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|b| !b.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    u32::from_str_radix(std::str::from_utf8(&rest[..end]).ok()?, 16).ok()
}

/// Extract ` name=...` — everything up to the line ending, spaces included
fn attr_str(line: &[u8], key: &[u8]) -> Option<String> {
    let start = find(line, key)? + key.len();
    let value = trim_eol(&line[start..]);
    if value.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(value).into_owned())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
