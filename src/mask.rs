//! WebSocket frame masking

use std::cell::Cell;

/// Apply (or remove) a frame mask in place
///
/// Masking is an involution: applying the same key twice restores the input.
/// Works a word at a time with a scalar tail.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let key = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap());
        chunk.copy_from_slice(&(word ^ key).to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(0) };
}

/// Generate a masking key using thread-local xorshift64 state
///
/// Masking keys need to be unpredictable to proxies, not cryptographically
/// strong (RFC 6455 section 10.3).
#[inline]
pub fn generate_mask() -> [u8; 4] {
    RNG_STATE.with(|state| {
        let mut s = state.get();

        if s == 0 {
            s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            s ^= &s as *const _ as u64;
            s |= 1;
        }

        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;

        state.set(s);
        (s as u32).to_ne_bytes()
    })
}
