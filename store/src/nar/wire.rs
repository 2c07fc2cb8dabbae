//! Fixed byte sequences of the NAR grammar.
//!
//! Everything between the variable-length pieces of an archive (names,
//! targets, file contents) is a constant run of framed keywords, so each
//! run is baked into one `TOK_*` constant the writer emits whole and the
//! reader matches against.
//!
//! The constants say nothing about validity; the bounds below and the
//! ordering/charset rules for entry names live with the reader and
//! writer that enforce them.

/// Longest allowed directory entry name (the usual filesystem limit).
pub const MAX_NAME_LEN: usize = 255;
/// Longest allowed symlink target (the usual filesystem limit).
pub const MAX_TARGET_LEN: usize = 4095;

pub const TOK_NAR: [u8; 56] = *b"\x0d\0\0\0\0\0\0\0nix-archive-1\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0type\0\0\0\0";
pub const TOK_SYM: [u8; 32] = *b"\x07\0\0\0\0\0\0\0symlink\0\x06\0\0\0\0\0\0\0target\0\0";
pub const TOK_REG: [u8; 32] = *b"\x07\0\0\0\0\0\0\0regular\0\x08\0\0\0\0\0\0\0contents";
pub const TOK_EXE: [u8; 64] = *b"\x07\0\0\0\0\0\0\0regular\0\x0a\0\0\0\0\0\0\0executable\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x08\0\0\0\0\0\0\0contents";
pub const TOK_DIR: [u8; 24] = *b"\x09\0\0\0\0\0\0\0directory\0\0\0\0\0\0\0";
pub const TOK_ENT: [u8; 48] = *b"\x05\0\0\0\0\0\0\0entry\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0name\0\0\0\0";
pub const TOK_NOD: [u8; 48] = *b"\x04\0\0\0\0\0\0\0node\0\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0type\0\0\0\0";
pub const TOK_PAR: [u8; 16] = *b"\x01\0\0\0\0\0\0\0)\0\0\0\0\0\0\0";

#[cfg(test)]
mod tests {
    /// Splits a token back into the framed strings it was built from,
    /// verifying each length prefix and its zero padding on the way.
    fn words(mut token: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        while !token.is_empty() {
            let (header, rest) = token.split_at(8);
            let len = u64::from_le_bytes(header.try_into().unwrap()) as usize;
            let framed = (len + 7) & !7;

            out.push(String::from_utf8(rest[..len].to_vec()).unwrap());
            assert!(
                rest[len..framed].iter().all(|&b| b == 0),
                "padding must be zero"
            );
            token = &rest[framed..];
        }
        out
    }

    #[test]
    fn tokens_decode_to_their_keywords() {
        assert_eq!(words(&super::TOK_NAR), ["nix-archive-1", "(", "type"]);
        assert_eq!(words(&super::TOK_SYM), ["symlink", "target"]);
        assert_eq!(words(&super::TOK_REG), ["regular", "contents"]);
        assert_eq!(
            words(&super::TOK_EXE),
            ["regular", "executable", "", "contents"]
        );
        assert_eq!(words(&super::TOK_DIR), ["directory"]);
        assert_eq!(words(&super::TOK_ENT), ["entry", "(", "name"]);
        assert_eq!(words(&super::TOK_NOD), ["node", "(", "type"]);
        assert_eq!(words(&super::TOK_PAR), [")"]);
    }
}
