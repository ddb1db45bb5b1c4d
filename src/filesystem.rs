//! Helpers for request paths

use crate::errors::{Result, Error};

/// Normalizes a path.
///
/// The following operations are performed:
///
/// 1. Sequences of multiple `'/'` characters are collapsed into a single `'/'`.
/// 2. Any leading `'/'` is stripped. (If the request path doesn’t lead with a
///    slash, the path is ill-formed for our purposes and we return an `Err`).
/// 3. Percent-encoded bytes are decoded. Bogus percent-encoding, like `b"%bo"`,
///    will return `Err`.
/// 4. A `..` segment, before or after decoding, is refused with
///    `PermissionDenied`; scripts are looked up under a fixed root.
///
/// The query string must already have been split off.
pub fn normalize_path(path: &[u8]) -> Result<Vec<u8>> {
    if path.first() != Some(&b'/') {
        return Err(Error::PathNotInOriginForm);
    }

    let mut buffer = Vec::with_capacity(path.len() - 1);
    let mut i = 1;

    // skip leading '/' characters
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }

    while i < path.len() {
        match path[i] {
            b'/' => {
                buffer.push(b'/');
                while i < path.len() && path[i] == b'/' {
                    i += 1;
                }
            },
            b'%' => {
                if path.len() < i + 3 {
                    return Err(Error::IllegalPercentEncoding);
                }

                let high_nybble = path[i + 1];
                let low_nybble = path[i + 2];

                if !high_nybble.is_ascii_hexdigit() || !low_nybble.is_ascii_hexdigit() {
                    return Err(Error::IllegalPercentEncoding);
                }

                buffer.push(from_hexit(high_nybble) << 4 | from_hexit(low_nybble));

                i += 3;
            },
            b => {
                buffer.push(b);
                i += 1;
            }
        }
    }

    if buffer.split(|&b| b == b'/').any(|segment| segment == b"..") {
        return Err(Error::PermissionDenied);
    }

    Ok(buffer)
}

/// Splits a request-target into its path and query string.
///
/// The query is returned without its `'?'`, still percent-encoded.
pub fn split_query(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(i) => (&target[.. i], &target[i + 1 ..]),
        None => (target, "")
    }
}

/// Converts from a hexadecimal digit to its value; `x` must be a hexit.
fn from_hexit(x: u8) -> u8 {
    match x {
        b'0' ..= b'9' => x - b'0',
        b'A' ..= b'F' => x - b'A' + 10,
        _ => x - b'a' + 10
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_strips_leading_slashes() {
        assert_eq!(normalize_path(b"/blah").unwrap(), b"blah");
        assert_eq!(normalize_path(b"//bleh").unwrap(), b"bleh");
    }

    #[test]
    fn normalize_collapses_embedded_slash_sequences() {
        assert_eq!(normalize_path(b"/foo//bar").unwrap(), b"foo/bar");
    }

    #[test]
    fn normalize_decodes_percents() {
        assert_eq!(normalize_path(b"/foo%20bar").unwrap(), b"foo bar");
    }

    #[test]
    fn normalize_handles_trailing_percents_correctly() {
        assert_eq!(normalize_path(b"/trail%20").unwrap(), b"trail ");
    }

    #[test]
    fn normalize_errors_on_bogus_percent() {
        assert!(normalize_path(b"/bog%us").is_err());
        assert!(normalize_path(b"/short%2").is_err());
    }

    #[test]
    fn normalize_errors_without_leading_slash() {
        assert!(normalize_path(b"bogus").is_err());
        assert!(normalize_path(b"").is_err());
    }

    #[test]
    fn normalize_refuses_parent_segments() {
        match normalize_path(b"/cgi-bin/../etc/passwd") {
            Err(Error::PermissionDenied) => (),
            other => panic!("{:?}", other)
        }
        match normalize_path(b"/cgi-bin/%2e%2e/x") {
            Err(Error::PermissionDenied) => (),
            other => panic!("{:?}", other)
        }
        assert!(normalize_path(b"/cgi-bin/..x/y").is_ok());
    }

    #[test]
    fn split_query_works() {
        assert_eq!(split_query("/cgi-bin/a.cgi?x=1&y"), ("/cgi-bin/a.cgi", "x=1&y"));
        assert_eq!(split_query("/cgi-bin/a.cgi"), ("/cgi-bin/a.cgi", ""));
        assert_eq!(split_query("/a?"), ("/a", ""));
    }

    #[test]
    fn from_hexit_works() {
        use std::char;

        for x in 0x0 .. 0x10 {
            assert_eq!(from_hexit(char::from_digit(x, 16).unwrap() as u8), x as u8);
            assert_eq!(from_hexit(char::from_digit(x, 16).unwrap()
                                  .to_ascii_uppercase() as u8), x as u8);
        }
    }
}
