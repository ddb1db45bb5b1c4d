//! Parsers for CGI/1.1 framing

use crate::cgi::{Field, Header, Location, Status};

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_till, take_till1, take_while,
                           take_while1, take_while_m_n};
use nom::character::is_digit;
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::sequence::{preceded, terminated, tuple};

use std::str::{self, FromStr};

/// Extracts the boundary token from a `multipart/form-data` content type.
///
/// Only the exact form `multipart/form-data; boundary=<token>` is recognized,
/// where the token is the run of non-whitespace after the `=`. Anything else
/// is treated as a raw body by the caller.
pub fn multipart_boundary(content_type: &str) -> Option<&str> {
    let parsed: IResult<&str, &str> = preceded(
        tag("multipart/form-data; boundary="),
        take_till1(char::is_whitespace)
    )(content_type);

    parsed.ok().map(|(_, token)| token)
}

#[test]
fn boundary_plain() {
    assert_eq!(multipart_boundary("multipart/form-data; boundary=XYZ"),
               Some("XYZ"));
}

#[test]
fn boundary_stops_at_whitespace() {
    assert_eq!(multipart_boundary("multipart/form-data; boundary=a-b_c d=e"),
               Some("a-b_c"));
}

#[test]
fn boundary_keeps_trailing_parameters_in_token() {
    assert_eq!(multipart_boundary("multipart/form-data; boundary=abc;charset=x"),
               Some("abc;charset=x"));
}

#[test]
fn boundary_rejects_other_types() {
    assert_eq!(multipart_boundary("application/x-www-form-urlencoded"), None);
    assert_eq!(multipart_boundary("multipart/form-data; boundary="), None);
    assert_eq!(multipart_boundary("multipart/form-data;boundary=XYZ"), None);
    assert_eq!(multipart_boundary(""), None);
}

/// Returns `true` iff the line is nothing but a line terminator.
///
/// A bare `"\r"` only shows up as the very last line of a stream, since lines
/// are split on `'\n'`.
pub fn is_blank_line(line: &[u8]) -> bool {
    let parsed: IResult<&[u8], &[u8]> =
        all_consuming(alt((tag("\r\n"), tag("\n"), tag("\r"))))(line);
    parsed.is_ok()
}

#[test]
fn blank_lines() {
    assert!(is_blank_line(b"\n"));
    assert!(is_blank_line(b"\r\n"));
    assert!(is_blank_line(b"\r"));
    assert!(!is_blank_line(b""));
    assert!(!is_blank_line(b" \r\n"));
    assert!(!is_blank_line(b"\r\n\r\n"));
    assert!(!is_blank_line(b"X-Foo: bar\r\n"));
}

fn cr_or_lf(x: u8) -> bool {
    x == b'\n' || x == b'\r'
}

fn lwsp(x: u8) -> bool {
    x == b' ' || x == b'\t'
}

fn is_colon(x: u8) -> bool {
    x == b':'
}

fn code(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        map_res(take_while_m_n(3, 3, is_digit), str::from_utf8),
        u16::from_str
    )(input)
}

fn text(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_till(cr_or_lf)(input)
}

pub fn status(input: &[u8]) -> IResult<&[u8], Status> {
    map(
        tuple((
            tag_no_case("Status:"),
            take_while(lwsp),
            code,
            opt(preceded(take_while1(lwsp), text))
        )),
        |(_, _, code, phrase)| Status {
            code: code,
            reason_phrase: Vec::from(phrase.unwrap_or(&b""[..]))
        }
    )(input)
}

pub fn location(input: &[u8]) -> IResult<&[u8], Location> {
    map(
        preceded(tuple((tag_no_case("Location:"), take_while(lwsp))), text),
        |uri| Location { url: Vec::from(uri) }
    )(input)
}

pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    map(
        tuple((
            terminated(take_till1(|x: u8| is_colon(x) || cr_or_lf(x) || lwsp(x)),
                       tag(":")),
            take_while(lwsp),
            text
        )),
        |(name, _, content)| Header {
            name: Vec::from(name),
            content: Vec::from(content)
        }
    )(input)
}

/// Classifies a single CGI response header line.
pub fn field(input: &[u8]) -> IResult<&[u8], Field> {
    alt((
        map(status, Field::Status),
        map(location, Field::Location),
        map(header, Field::Header)
    ))(input)
}
