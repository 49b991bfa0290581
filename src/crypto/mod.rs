//! Filename obfuscation.
//!
//! Names in the string table are XORed byte-by-byte against the 4-byte key
//! stored in the header, cycling through the key.  The transform is its own
//! inverse.  It hides names from a casual `strings` dump and nothing more; it
//! is not encryption.

use rand::RngCore;

/// Byte length of the obfuscation key stored in the header.
pub const KEY_LEN: usize = 4;

/// Draw a fresh key for a new container.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// XOR `buf` in place against `key`, cycling from the first key byte.
pub fn xor_in_place(key: &[u8; KEY_LEN], buf: &mut [u8]) {
    for (b, k) in buf.iter_mut().zip(key.iter().cycle()) {
        *b ^= *k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_an_involution() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let original = b"textures/grass_01.png".to_vec();
        let mut buf = original.clone();
        xor_in_place(&key, &mut buf);
        assert_ne!(buf, original);
        xor_in_place(&key, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn key_cycles_every_four_bytes() {
        let key = [1, 2, 3, 4];
        let mut buf = [0u8; 9];
        xor_in_place(&key, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 1, 2, 3, 4, 1]);
    }

    #[test]
    fn zero_key_is_identity() {
        let mut buf = *b"abc";
        xor_in_place(&[0; KEY_LEN], &mut buf);
        assert_eq!(&buf, b"abc");
    }
}
