//! Plaintext plausibility and header-block splitting.
//!
//! Ciphertext and compressed payloads still look like bytes, so "is ASCII" is
//! not enough to tell them from headers. A block counts as header text only
//! when every byte is in the small set of characters legacy clients put in
//! header lines and it is at least `MIN_PLAUSIBLE_LEN` long.

/// Minimum length of a block that can pass as header text.
pub const MIN_PLAUSIBLE_LEN: usize = 8;

const CRLF_TERMINATOR: &[u8] = b"\r\n\r\n";
const LF_TERMINATOR: &[u8] = b"\n\n";

/// Whether `byte` may appear in plaintext header text.
pub fn is_header_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'+' | b'/'
                | b'='
                | b'-'
                | b'.'
                | b','
                | b' '
                | b'"'
                | b';'
                | b':'
                | b'?'
                | b'&'
                | b'\r'
                | b'\n'
                | b'('
                | b')'
                | b'%'
                | b'<'
                | b'>'
                | b'_'
        )
}

/// True when `data` looks like plaintext protocol headers.
pub fn is_plausible_header_text(data: &[u8]) -> bool {
    data.len() >= MIN_PLAUSIBLE_LEN && data.iter().all(|&b| is_header_byte(b))
}

/// A frame split at its first blank line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBlock<'a> {
    /// Bytes before the blank line (the whole frame when unterminated).
    pub head: &'a [u8],
    /// Bytes after the blank line.
    pub body: &'a [u8],
    /// Offset of the first body byte, i.e. header length plus terminator.
    pub body_offset: usize,
    /// Whether a blank-line terminator was found.
    pub terminated: bool,
}

/// Split `frame` at `\r\n\r\n`, falling back to `\n\n`.
///
/// A CRLF terminator anywhere in the frame takes precedence over an earlier
/// bare `\n\n`, matching what deployed clients expect.
pub fn split_header_block(frame: &[u8]) -> HeaderBlock<'_> {
    let found = find(frame, CRLF_TERMINATOR)
        .map(|pos| (pos, CRLF_TERMINATOR.len()))
        .or_else(|| find(frame, LF_TERMINATOR).map(|pos| (pos, LF_TERMINATOR.len())));

    match found {
        Some((pos, len)) => HeaderBlock {
            head: &frame[..pos],
            body: &frame[pos + len..],
            body_offset: pos + len,
            terminated: true,
        },
        None => HeaderBlock {
            head: frame,
            body: &[],
            body_offset: frame.len(),
            terminated: false,
        },
    }
}

/// Header bytes as text, one char per byte.
pub fn latin1_to_string(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
