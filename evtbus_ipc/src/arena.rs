//! Word-addressed circular arena over a shared-memory region.
//!
//! All wraparound arithmetic of the ring buffer lives here: callers pass a
//! word offset and a byte length, and the arena splits the copy into at most
//! two contiguous pieces (tail of the region, then head).

use crate::error::{IpcError, IpcResult};
use evtbus::consts::WORD_SIZE;
use std::ptr::NonNull;

/// Fixed-capacity circular byte region addressed in words
#[derive(Debug)]
pub struct Arena {
    base: NonNull<u8>,
    capacity_words: usize,
}

// SAFETY: the arena is a view into a process-shared mapping; the ring buffer
// serializes every write through its semaphore.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Build an arena over `capacity_words * WORD_SIZE` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of the whole region for the
    /// lifetime of the arena and aligned to `WORD_SIZE`.
    pub unsafe fn from_raw(base: NonNull<u8>, capacity_words: usize) -> Self {
        Self {
            base,
            capacity_words,
        }
    }

    /// Region size in words
    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    /// Region size in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_words * WORD_SIZE
    }

    /// Words needed to hold `len_bytes` bytes
    pub fn words_for(len_bytes: usize) -> usize {
        len_bytes.div_ceil(WORD_SIZE)
    }

    /// Offset `words` past `offset`, modulo capacity
    pub fn advance(&self, offset: usize, words: usize) -> usize {
        (offset + words) % self.capacity_words
    }

    /// Copy `bytes` into the region starting at word `offset`, wrapping at the
    /// end. Padding up to the next word boundary is zeroed.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> IpcResult<()> {
        let words = Self::words_for(bytes.len());
        self.check(offset, words)?;

        let start = offset * WORD_SIZE;
        let padded = words * WORD_SIZE;
        let tail = (self.capacity_bytes() - start).min(padded);

        // SAFETY: `check` guarantees start < capacity and padded <= capacity,
        // so both pieces stay inside the region.
        unsafe {
            let dst = self.base.as_ptr();
            let first = tail.min(bytes.len());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(start), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    dst,
                    bytes.len() - first,
                );
            }
            if padded > bytes.len() {
                // Padding always lands in one piece: it is shorter than a word
                // and both pieces are word aligned.
                let pad_start = (start + bytes.len()) % self.capacity_bytes();
                std::ptr::write_bytes(dst.add(pad_start), 0, padded - bytes.len());
            }
        }
        Ok(())
    }

    /// Copy `len_bytes` bytes out of the region starting at word `offset`.
    pub fn read_at(&self, offset: usize, len_bytes: usize) -> IpcResult<Vec<u8>> {
        self.check(offset, Self::words_for(len_bytes))?;

        let start = offset * WORD_SIZE;
        let first = (self.capacity_bytes() - start).min(len_bytes);
        let mut out = Vec::with_capacity(len_bytes);

        // SAFETY: bounds verified by `check`; `out` has room for len_bytes.
        unsafe {
            let src = self.base.as_ptr();
            std::ptr::copy_nonoverlapping(src.add(start), out.as_mut_ptr(), first);
            if first < len_bytes {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr().add(first), len_bytes - first);
            }
            out.set_len(len_bytes);
        }
        Ok(out)
    }

    /// Read one little-endian word.
    pub fn read_word(&self, offset: usize) -> IpcResult<u32> {
        let bytes = self.read_at(offset, WORD_SIZE)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn check(&self, offset: usize, words: usize) -> IpcResult<()> {
        if offset >= self.capacity_words {
            return Err(IpcError::invalid(format!(
                "arena offset {offset} outside capacity {}",
                self.capacity_words
            )));
        }
        if words > self.capacity_words {
            return Err(IpcError::invalid(format!(
                "{words} words exceed arena capacity {}",
                self.capacity_words
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(storage: &mut Vec<u32>) -> Arena {
        let base = NonNull::new(storage.as_mut_ptr() as *mut u8).unwrap();
        unsafe { Arena::from_raw(base, storage.len()) }
    }

    #[test]
    fn test_words_for_rounds_up() {
        assert_eq!(Arena::words_for(0), 0);
        assert_eq!(Arena::words_for(1), 1);
        assert_eq!(Arena::words_for(4), 1);
        assert_eq!(Arena::words_for(5), 2);
    }

    #[test]
    fn test_contiguous_copy() {
        let mut storage = vec![0u32; 8];
        let a = arena(&mut storage);
        a.write_at(2, b"hello").unwrap();
        assert_eq!(a.read_at(2, 5).unwrap(), b"hello");
        // padding of the second word is zeroed
        assert_eq!(a.read_at(3, 4).unwrap(), [b'o', 0, 0, 0]);
    }

    #[test]
    fn test_wrapped_copy_splits_in_two() {
        let mut storage = vec![0xFFFF_FFFFu32; 4];
        let a = arena(&mut storage);
        let data = b"0123456789";
        a.write_at(3, data).unwrap();
        assert_eq!(a.read_at(3, data.len()).unwrap(), data);
        // head of region holds the wrapped part, padded with zeros
        assert_eq!(a.read_at(0, 8).unwrap(), b"456789\0\0");
        assert_eq!(a.advance(3, 3), 2);
    }

    #[test]
    fn test_read_word_is_little_endian() {
        let mut storage = vec![0u32; 2];
        let a = arena(&mut storage);
        a.write_at(1, &0x0102_0304u32.to_le_bytes()).unwrap();
        assert_eq!(a.read_word(1).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let mut storage = vec![0u32; 2];
        let a = arena(&mut storage);
        assert!(matches!(a.write_at(2, b"x"), Err(IpcError::InvalidArgument { .. })));
        assert!(matches!(
            a.read_at(0, 9),
            Err(IpcError::InvalidArgument { .. })
        ));
    }
}
