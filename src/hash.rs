//! Murmur3 hash over the container's 32-bit word stream.
//!
//! The writer hashes every word as it is appended and the reader re-hashes
//! the whole stream on open, so the trailer word is the single source of
//! truth for stream integrity.

/// Incremental MurmurHash3 (x86 32-bit variant) fed one word per block.
#[derive(Debug, Clone)]
pub struct Murmur3 {
    state: u32,
    words: u32,
}

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

impl Murmur3 {
    /// Create a hasher with the given seed.
    pub fn new(seed: u32) -> Self {
        Self {
            state: seed,
            words: 0,
        }
    }

    /// Mix one 32-bit word into the hash state.
    #[inline]
    pub fn hash_word(&mut self, word: u32) {
        let mut k = word.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        let mut h = self.state ^ k;
        h = h.rotate_left(13);
        self.state = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
        self.words = self.words.wrapping_add(1);
    }

    /// Finalize over the total byte length and return the hash value.
    #[inline]
    pub fn finalize(self) -> u32 {
        let mut h = self.state ^ self.words.wrapping_mul(4);
        h ^= h >> 16;
        h = h.wrapping_mul(0x85eb_ca6b);
        h ^= h >> 13;
        h = h.wrapping_mul(0xc2b2_ae35);
        h ^= h >> 16;
        h
    }
}

/// Hash a word slice in one call.
pub fn hash_words(words: &[u32], seed: u32) -> u32 {
    let mut hasher = Murmur3::new(seed);
    for &word in words {
        hasher.hash_word(word);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_oneshot() {
        let words = [0xdead_beef, 0x0123_4567, 0x89ab_cdef, 0];
        let mut hasher = Murmur3::new(0x5ee3);
        for &w in &words {
            hasher.hash_word(w);
        }
        assert_eq!(hasher.finalize(), hash_words(&words, 0x5ee3));
    }

    #[test]
    fn test_seed_changes_hash() {
        let words = [1, 2, 3];
        assert_ne!(hash_words(&words, 0), hash_words(&words, 1));
    }

    #[test]
    fn test_single_word_avalanche() {
        // Flipping one input bit must change the output.
        let base = hash_words(&[0x8000_0000], 7);
        for bit in 0..32 {
            let flipped = hash_words(&[0x8000_0000 ^ (1u32 << bit)], 7);
            if bit != 31 {
                assert_ne!(base, flipped, "bit {} did not affect hash", bit);
            }
        }
    }

    #[test]
    fn test_length_extension_differs() {
        // Appending a zero word must not collide with the shorter stream.
        assert_ne!(hash_words(&[5], 0), hash_words(&[5, 0], 0));
    }
}
