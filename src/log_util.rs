//! Smol utilities for logging

use std::ascii;

/// Make an Ascii-safe string out of bytes a CGI program sent us
pub fn ascii_escape(s: &[u8]) -> String {
    s.iter()
        .flat_map(|&b| ascii::escape_default(b))
        .map(char::from)
        .collect()
}

#[test]
fn ascii_escape_control_and_high_bytes() {
    assert_eq!(ascii_escape(b"Status: 200\r\n\xff"), "Status: 200\\r\\n\\xff");
}
