//! UTF-8 validation for text payloads
//!
//! Complete messages are checked with `simdutf8`; fragmented text messages
//! use the partial check, which accepts a valid prefix with an incomplete
//! trailing sequence so validation can run per fragment instead of waiting
//! for reassembly.

/// Validate that the input is complete, valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate a possibly-incomplete UTF-8 prefix
///
/// Returns `true` when the input is valid UTF-8 or ends in an incomplete but
/// so-far-valid multi-byte sequence. Returns `false` only for byte sequences
/// that can never become valid with more input.
#[inline]
pub fn validate_utf8_partial(data: &[u8]) -> bool {
    match std::str::from_utf8(data) {
        Ok(_) => true,
        // error_len() of None means the error is an unexpected end of input
        Err(e) => e.error_len().is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_complete() {
        assert!(validate_utf8(b"Hello"));
        assert!(validate_utf8("héllo wörld ✓".as_bytes()));
        assert!(validate_utf8(b""));
    }

    #[test]
    fn invalid_complete() {
        assert!(!validate_utf8(&[0xff, 0xfe]));
        assert!(!validate_utf8(&[0xc0, 0x80])); // overlong NUL
        assert!(!validate_utf8(&[0xed, 0xa0, 0x80])); // surrogate
    }

    #[test]
    fn partial_accepts_truncated_sequence() {
        let s = "héllo".as_bytes();
        // cut inside the two-byte 'é'
        assert!(validate_utf8_partial(&s[..2]));
        assert!(!validate_utf8(&s[..2]));

        // first three bytes of a four-byte scalar
        assert!(validate_utf8_partial(&[0xf0, 0x9f, 0x98]));
    }

    #[test]
    fn partial_rejects_hopeless_input() {
        assert!(!validate_utf8_partial(&[0x48, 0xff]));
        assert!(!validate_utf8_partial(&[0xed, 0xa0, 0x80, 0x62]));
    }
}
