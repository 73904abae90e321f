//! Byte-oriented RC4 keystream.
//!
//! The legacy client population only speaks RC4, so this is the primitive the
//! session layer builds on. The state is `Clone` so a caller can run a trial
//! decryption and commit it only when the plaintext checks out.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// RC4 keystream generator state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Run the key schedule for `key`.
    ///
    /// An empty key yields the identity permutation; callers always pass
    /// derived 16-byte keys.
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }

        if !key.is_empty() {
            let mut j: u8 = 0;
            for i in 0..256 {
                j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
                s.swap(i, j as usize);
            }
        }

        Self { s, i: 0, j: 0 }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[idx as usize];
        }
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer_key() {
        // Classic test vector: key "Key", plaintext "Plaintext".
        let mut rc4 = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        rc4.apply_keystream(&mut data);
        assert_eq!(data, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    #[test]
    fn known_answer_wiki() {
        let mut rc4 = Rc4::new(b"Wiki");
        let mut data = *b"pedia";
        rc4.apply_keystream(&mut data);
        assert_eq!(data, [0x10, 0x21, 0xBF, 0x04, 0x20]);
    }

    #[test]
    fn split_application_matches_single_pass() {
        let mut whole = Rc4::new(b"Secret");
        let mut a = *b"Attack at dawn";
        whole.apply_keystream(&mut a);

        let mut split = Rc4::new(b"Secret");
        let mut b = *b"Attack at dawn";
        let (left, right) = b.split_at_mut(5);
        split.apply_keystream(left);
        split.apply_keystream(right);

        assert_eq!(a, b);
    }

    #[test]
    fn clone_does_not_advance_original() {
        let mut original = Rc4::new(b"Secret");
        let mut trial = original.clone();

        let mut first = [0u8; 4];
        trial.apply_keystream(&mut first);

        let mut second = [0u8; 4];
        original.apply_keystream(&mut second);
        assert_eq!(first, second);
    }
}
