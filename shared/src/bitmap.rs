use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length bitmap packed into 64-bit words.
///
/// Bits past `len` in the last word are kept clear so whole-word scans never
/// report them.
#[derive(Clone, Debug)]
pub struct SlotBitmap {
    words: Box<[u64]>,
    len: usize,
}

impl SlotBitmap {
    /// A bitmap of `len` bits, all set to `value`.
    pub fn new(len: usize, value: bool) -> Self {
        let mut bitmap = Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        };
        bitmap.set_all(value);
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_all(&mut self, value: bool) {
        self.words.fill(if value { u64::MAX } else { 0 });
        let tail = self.len % WORD_BITS;
        if value && tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last = (1 << tail) - 1;
            }
        }
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        let word = &mut self.words[idx / WORD_BITS];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Find the lowest bit equal to `value`, flip it, and return its index.
    pub fn scan_and_flip(&mut self, value: bool) -> Option<usize> {
        let idx = self.words.iter().enumerate().find_map(|(i, &word)| {
            let candidates = if value { word } else { !word };
            (candidates != 0).then(|| i * WORD_BITS + candidates.trailing_zeros() as usize)
        })?;
        if idx >= self.len {
            return None;
        }
        self.set(idx, !value);
        Some(idx)
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_and_flip_takes_lowest() {
        let mut bitmap = SlotBitmap::new(70, true);
        assert_eq!(bitmap.count_ones(), 70);
        assert_eq!(bitmap.scan_and_flip(true), Some(0));
        assert_eq!(bitmap.scan_and_flip(true), Some(1));
        bitmap.set(0, true);
        assert_eq!(bitmap.scan_and_flip(true), Some(0));
        assert_eq!(bitmap.count_ones(), 68);
    }

    #[test]
    fn exhausts_without_touching_tail_bits() {
        let mut bitmap = SlotBitmap::new(65, true);
        for i in 0..65 {
            assert_eq!(bitmap.scan_and_flip(true), Some(i));
        }
        assert_eq!(bitmap.scan_and_flip(true), None);
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    fn clear_scan_stops_at_len() {
        let mut bitmap = SlotBitmap::new(3, false);
        assert_eq!(bitmap.scan_and_flip(false), Some(0));
        assert_eq!(bitmap.scan_and_flip(false), Some(1));
        assert_eq!(bitmap.scan_and_flip(false), Some(2));
        // Bits 3..64 of the word are clear padding, not free slots.
        assert_eq!(bitmap.scan_and_flip(false), None);
        assert!(bitmap.get(2));
    }
}
