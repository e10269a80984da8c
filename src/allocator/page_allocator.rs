//! In-memory page frames backing the resident part of the log.
//!
//! Page `p` lives in frame `p % frames`. Frames are arrays of atomic words so
//! the header word of a record can be locked and updated in place while other
//! workers read the rest of the page. Bytes are stored little endian.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD: usize = 8;

/// One resident page.
pub(crate) struct PageFrame {
    words: Box<[AtomicU64]>,
}

impl PageFrame {
    fn new(page_size: usize) -> Self {
        let words: Vec<AtomicU64> = (0..page_size / WORD).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into_boxed_slice(),
        }
    }

    /// Atomic word at byte `offset` (must be 8-aligned).
    #[inline]
    pub(crate) fn word(&self, offset: usize) -> Option<&AtomicU64> {
        if offset % WORD != 0 {
            return None;
        }
        self.words.get(offset / WORD)
    }

    /// Copy `dst.len()` bytes starting at `offset`.
    ///
    /// Returns `None` if the range leaves the page.
    pub(crate) fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Option<()> {
        if offset.checked_add(dst.len())? > self.len() {
            return None;
        }
        let mut pos = offset;
        let mut out = 0;
        while out < dst.len() {
            let word = self.words[pos / WORD].load(Ordering::Acquire).to_le_bytes();
            let start = pos % WORD;
            let n = (WORD - start).min(dst.len() - out);
            dst[out..out + n].copy_from_slice(&word[start..start + n]);
            out += n;
            pos += n;
        }
        Some(())
    }

    /// Store `src` starting at `offset`.
    ///
    /// Partial words are merged with their current contents. Only the owner of
    /// a record writes its bytes, so the merge does not race with other writers.
    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) -> Option<()> {
        if offset.checked_add(src.len())? > self.len() {
            return None;
        }
        let mut pos = offset;
        let mut consumed = 0;
        while consumed < src.len() {
            let slot = &self.words[pos / WORD];
            let start = pos % WORD;
            let n = (WORD - start).min(src.len() - consumed);
            let value = if start == 0 && n == WORD {
                let mut raw = [0u8; WORD];
                raw.copy_from_slice(&src[consumed..consumed + WORD]);
                raw
            } else {
                let mut raw = slot.load(Ordering::Acquire).to_le_bytes();
                raw[start..start + n].copy_from_slice(&src[consumed..consumed + n]);
                raw
            };
            slot.store(u64::from_le_bytes(value), Ordering::Release);
            consumed += n;
            pos += n;
        }
        Some(())
    }

    /// Zero the whole frame.
    pub(crate) fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Size in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.words.len() * WORD
    }
}

/// Fixed ring of page frames.
pub(crate) struct PageArena {
    frames: Box<[PageFrame]>,
    page_bits: u32,
}

impl PageArena {
    pub(crate) fn new(frames: usize, page_bits: u32) -> Self {
        let page_size = 1usize << page_bits;
        let frames: Vec<PageFrame> = (0..frames).map(|_| PageFrame::new(page_size)).collect();
        Self {
            frames: frames.into_boxed_slice(),
            page_bits,
        }
    }

    /// Number of frames.
    #[inline]
    pub(crate) fn frames(&self) -> u64 {
        self.frames.len() as u64
    }

    /// Frame that holds `page`.
    #[inline]
    pub(crate) fn frame(&self, page: u64) -> &PageFrame {
        &self.frames[(page % self.frames()) as usize]
    }

    /// Page size in bytes.
    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        1 << self.page_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_byte_access() {
        let arena = PageArena::new(2, 6);
        let frame = arena.frame(3);
        frame.write_bytes(5, b"hello world").unwrap();

        let mut out = [0u8; 11];
        frame.read_bytes(5, &mut out).unwrap();
        assert_eq!(&out, b"hello world");

        let mut head = [0xFFu8; 5];
        frame.read_bytes(0, &mut head).unwrap();
        assert_eq!(head, [0u8; 5]);
    }

    #[test]
    fn test_bounds_checked() {
        let arena = PageArena::new(1, 6);
        let frame = arena.frame(0);
        assert_eq!(frame.len(), 64);
        assert!(frame.write_bytes(60, &[1u8; 8]).is_none());
        assert!(frame.read_bytes(64, &mut [0u8; 1]).is_none());
        assert!(frame.word(64).is_none());
        assert!(frame.word(3).is_none());
        assert!(frame.word(56).is_some());
    }

    #[test]
    fn test_frames_wrap() {
        let arena = PageArena::new(4, 6);
        arena.frame(1).write_bytes(0, &[7u8; 8]).unwrap();
        let mut out = [0u8; 8];
        arena.frame(5).read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [7u8; 8]);

        arena.frame(5).clear();
        arena.frame(1).read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [0u8; 8]);
    }
}
