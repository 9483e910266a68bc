//! MurmurHash3 (x86, 32-bit).
//!
//! Used to spread correlation values over index shards. The output must stay
//! stable across releases: changing it would re-route lookups to shards that
//! do not hold the existing index entries.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

#[inline]
fn mix_block(mut k: u32) -> u32 {
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k.wrapping_mul(C2)
}

/// Hashes `bytes` with MurmurHash3_x86_32 using the given seed.
pub fn murmur3_32(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut blocks = bytes.chunks_exact(4);

    for block in blocks.by_ref() {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_block(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        if tail.len() > 2 {
            k ^= u32::from(tail[2]) << 16;
        }
        if tail.len() > 1 {
            k ^= u32::from(tail[1]) << 8;
        }
        k ^= u32::from(tail[0]);
        h ^= mix_block(k);
    }

    // Only the low 32 bits of the length take part, as in the reference.
    h ^= bytes.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_reference_values() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"", 0xffff_ffff), 0x81f1_6f39);
    }

    #[test]
    fn text_reference_values() {
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn seed_changes_output() {
        assert_ne!(murmur3_32(b"abc", 42), murmur3_32(b"abc", 0));
    }

    #[test]
    fn every_tail_length_is_deterministic() {
        let input = b"abcdefg";
        for len in 0..=input.len() {
            let slice = &input[..len];
            assert_eq!(murmur3_32(slice, 42), murmur3_32(slice, 42));
        }
    }
}
