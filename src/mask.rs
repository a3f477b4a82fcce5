/// XORs `buf` with `mask`, repeating the key every 4 bytes.
///
/// Masking is an involution: applying the same key twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let masked = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&masked.to_ne_bytes());
    }

    // the tail starts on a 4-byte boundary, so the key lines up from index 0
    for (byte, key) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}
