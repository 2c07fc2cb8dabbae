//! The base-32 text encoding used in store path digests and hash
//! renderings.
//!
//! zb keeps Nix's on-disk format: the input bytes form a little-endian
//! bit string, group `k` of the encoding covers bits `[5k, 5k+5)`, and
//! the groups are printed highest-first with no padding. The 32-digit
//! alphabet drops the easily-confused letters e, o, t and u.

use thiserror::Error;

pub const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

#[derive(Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("byte {0:#04x} is not a nixbase32 digit")]
    BadDigit(u8),
    #[error("{0} is not a possible nixbase32 length")]
    BadLength(usize),
    #[error("encoding carries set bits past the end of the value")]
    TrailingBits,
}

/// Encodes `input` as nixbase32.
pub fn encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(encode_len(input.len()));
    for k in (0..encode_len(input.len())).rev() {
        out.push(ALPHABET[group(input, k) as usize] as char);
    }
    out
}

/// Extracts the `k`-th 5-bit group from the little-endian bit string
/// formed by `bytes`. The group may straddle a byte boundary, in which
/// case its upper bits come from the following byte.
fn group(bytes: &[u8], k: usize) -> u8 {
    let bit = k * 5;
    let shift = bit % 8;

    let mut word = (bytes[bit / 8] as u16) >> shift;
    if let Some(&next) = bytes.get(bit / 8 + 1) {
        word |= (next as u16) << (8 - shift);
    }
    (word & 0x1f) as u8
}

/// The value of one alphabet digit, which is also its index in
/// [ALPHABET].
fn digit_value(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u8)
}

/// Reports whether `c` is a nixbase32 digit.
pub fn is_alphabet_char(c: u8) -> bool {
    digit_value(c).is_some()
}

/// Decodes a nixbase32 string.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    // only lengths that some byte count encodes to are decodable; this
    // also rules out the one-digit input, which would decode to zero
    // bytes with nowhere to put the digit's bits
    if encode_len(decode_len(input.len())) != input.len() {
        return Err(DecodeError::BadLength(input.len()));
    }

    let mut out = vec![0u8; decode_len(input.len())];
    decode_into(input, &mut out)?;
    Ok(out)
}

/// Decodes into an array of a fixed size, rejecting input of any other
/// encoded length.
pub fn decode_fixed<const K: usize>(input: impl AsRef<[u8]>) -> Result<[u8; K], DecodeError> {
    let input = input.as_ref();
    if input.len() != encode_len(K) {
        return Err(DecodeError::BadLength(input.len()));
    }

    let mut out = [0u8; K];
    decode_into(input, &mut out)?;
    Ok(out)
}

fn decode_into(input: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    // the last character of the string is group 0; walk the groups
    // upward and scatter each digit's five bits over the one or two
    // bytes they land in
    for (k, &c) in input.iter().rev().enumerate() {
        let value = digit_value(c).ok_or(DecodeError::BadDigit(c))? as u16;
        let bit = k * 5;
        let index = bit / 8;

        let spread = value << (bit % 8);
        out[index] |= spread as u8;

        let spill = (spread >> 8) as u8;
        if index + 1 < out.len() {
            out[index + 1] |= spill;
        } else if spill != 0 {
            // the top group may only use the bits the byte count
            // leaves for it
            return Err(DecodeError::TrailingBits);
        }
    }
    Ok(())
}

/// Bytes produced by decoding a string of `len` digits.
pub const fn decode_len(len: usize) -> usize {
    len * 5 / 8
}

/// Digits produced by encoding `len` bytes.
pub const fn encode_len(len: usize) -> usize {
    // ceil(len * 8 / 5)
    (len * 8).div_ceil(5)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", &[])]
    #[case::one_byte("0z", &hex!("1f"))]
    #[case::store_path_digest("00bgd045z0d4icpbc2yyz4gx48ak44la", &hex!("8a12321522fd91efbd60ebb2481af88580f61600"))]
    #[case::sha256_digest("0c5b8vw40dy178xlpddw65q9gf1h2186jcc3p4swinwggbllv8mk", &hex!("b3a24de97a8fdbc835b9833169501030b8977031bcb54b3b3ac13740f846ab30"))]
    fn round_trip(#[case] text: &str, #[case] bytes: &[u8]) {
        assert_eq!(super::encode(bytes), text);
        assert_eq!(super::decode(text.as_bytes()).unwrap(), bytes);
    }

    #[test]
    fn every_digit_maps_to_its_alphabet_index() {
        for (i, &c) in super::ALPHABET.iter().enumerate() {
            assert_eq!(super::digit_value(c), Some(i as u8));
            assert!(super::is_alphabet_char(c));
        }
        for c in [b'e', b'o', b't', b'u', b'E', b'.', 0xff] {
            assert!(!super::is_alphabet_char(c));
        }
    }

    #[test]
    fn rejects_digits_outside_the_alphabet() {
        super::decode(b"0e").expect_err("e is not in the alphabet");
    }

    #[test]
    fn rejects_impossible_lengths() {
        // no byte count encodes to a single digit
        assert_eq!(
            super::decode(b"z"),
            Err(super::DecodeError::BadLength(1))
        );
    }

    #[test]
    fn rejects_spill_past_the_value() {
        // two digits carry 10 bits but decode to a single byte; the
        // top digit may only use bits 5..8, so anything with its upper
        // two bits set cannot round-trip
        super::decode(b"zz").expect_err("z spills past the byte");
        super::decode(b"c0").expect_err("c spills past the byte");
        // '3' = 0b00011 fits exactly in the remaining three bits
        assert_eq!(super::decode(b"3z").unwrap(), vec![0x7f]);
    }

    #[test]
    fn fixed_size_decoding() {
        assert_eq!(
            super::decode_fixed::<20>("00bgd045z0d4icpbc2yyz4gx48ak44la").unwrap(),
            hex!("8a12321522fd91efbd60ebb2481af88580f61600"),
        );
        super::decode_fixed::<32>("00bgd045z0d4icpbc2yyz4gx48ak44la")
            .expect_err("20-byte encoding cannot fill 32 bytes");
    }

    #[test]
    fn length_arithmetic() {
        assert_eq!(super::encode_len(0), 0);
        assert_eq!(super::encode_len(20), 32);
        assert_eq!(super::encode_len(32), 52);
        assert_eq!(super::decode_len(32), 20);
        assert_eq!(super::decode_len(52), 32);
    }
}
