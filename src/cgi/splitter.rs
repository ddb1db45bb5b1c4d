//! Splitting CGI program output into header lines and a body
//!
//! A CGI response is a run of header lines, one blank line (`\n` or `\r\n`),
//! then the body. Header lines are kept verbatim apart from their terminator;
//! nothing is parsed or merged, so duplicate names survive. Everything after
//! the blank line, including whatever was already sitting in the read buffer,
//! is body.

use crate::cgi::{HeaderLine, ResponseSink};
use crate::cgi::body::CHUNK_SIZE;
use crate::cgi::parser::is_blank_line;
use crate::errors::{Error, Result};
use crate::log_util::ascii_escape;

use log::{debug, warn};

use std::io::{self, BufRead};

/// Strips one trailing `\n` and then one trailing `\r`, if present.
fn trim_terminator(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// How far body forwarding got
#[derive(Debug)]
pub struct Forwarded {
    pub bytes: u64,
    /// Set if forwarding stopped early, either reading or handing bytes on
    pub error: Option<io::Error>
}

/// Reads a CGI response from a buffered stream
#[derive(Debug)]
pub struct Splitter<R> {
    reader: R
}

impl<R: BufRead> Splitter<R> {
    pub fn new(reader: R) -> Splitter<R> {
        Splitter { reader: reader }
    }

    /// Reads header lines up to and including the blank line.
    ///
    /// If the stream ends first the lines read so far are thrown away and
    /// `Error::PrematureEndOfHeaders` is returned.
    pub fn headers(&mut self) -> Result<Vec<HeaderLine>> {
        let mut lines = Vec::new();

        loop {
            let mut line = Vec::new();
            let read = self.reader.read_until(b'\n', &mut line)
                .map_err(Error::Read)?;

            if read == 0 {
                if let Some(last) = lines.last() {
                    let HeaderLine(ref last) = *last;
                    warn!("CGI output ended after {} header line(s); last was \"{}\"",
                          lines.len(), ascii_escape(last));
                }
                return Err(Error::PrematureEndOfHeaders);
            }

            if is_blank_line(&line) {
                debug!("Read {} CGI header line(s)", lines.len());
                return Ok(lines);
            }

            lines.push(HeaderLine(trim_terminator(line)));
        }
    }

    /// Reads the next run of body bytes; `Ok(0)` at the end of the stream.
    pub fn read_chunk(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.reader.read(buffer) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other
            }
        }
    }

    /// Passes the rest of the stream to `sink`, one bounded chunk at a time.
    pub fn forward(&mut self, sink: &mut dyn ResponseSink) -> Forwarded {
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut forwarded = Forwarded { bytes: 0, error: None };

        loop {
            let read = match self.read_chunk(&mut buffer) {
                Ok(0) => return forwarded,
                Ok(n) => n,
                Err(e) => {
                    forwarded.error = Some(e);
                    return forwarded;
                }
            };

            if let Err(e) = sink.body(&buffer[.. read]) {
                forwarded.error = Some(e);
                return forwarded;
            }
            forwarded.bytes += read as u64;
        }
    }

    /// Reads and drops whatever is left.
    pub fn discard(&mut self) -> io::Result<u64> {
        io::copy(&mut self.reader, &mut io::sink())
    }
}

/// Splits `reader` into `sink` from a single thread.
///
/// Headers reach `sink` only once the blank line has been seen.
pub fn split<R: BufRead>(reader: R, sink: &mut dyn ResponseSink) -> Result<Forwarded> {
    let mut splitter = Splitter::new(reader);
    let headers = splitter.headers()?;
    sink.headers(&headers)?;
    Ok(splitter.forward(sink))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cgi::Collected;

    use std::io::{BufReader, Read};

    fn lines(expected: &[&str]) -> Vec<HeaderLine> {
        expected.iter().map(|l| HeaderLine(Vec::from(l.as_bytes()))).collect()
    }

    #[test]
    fn status_and_content_type() {
        let mut sink = Collected::default();
        let input: &[u8] = b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nHello";

        let forwarded = split(input, &mut sink).unwrap();

        assert_eq!(sink.headers, lines(&["Status: 200 OK", "Content-Type: text/plain"]));
        assert_eq!(sink.body, b"Hello");
        assert_eq!(forwarded.bytes, 5);
        assert!(forwarded.error.is_none());
    }

    #[test]
    fn bare_newlines() {
        let mut sink = Collected::default();
        let input: &[u8] = b"Content-Type: text/html\n\n<p>\n\n</p>\n";

        split(input, &mut sink).unwrap();

        assert_eq!(sink.headers, lines(&["Content-Type: text/html"]));
        assert_eq!(sink.body, b"<p>\n\n</p>\n");
    }

    #[test]
    fn blank_line_is_neither_header_nor_body() {
        let mut sink = Collected::default();
        let input: &[u8] = b"A: 1\r\n\r\n\r\nbody";

        split(input, &mut sink).unwrap();

        assert_eq!(sink.headers, lines(&["A: 1"]));
        assert_eq!(sink.body, b"\r\nbody");
    }

    #[test]
    fn duplicate_headers_are_kept() {
        let mut sink = Collected::default();
        let input: &[u8] = b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\nnot even a header\r\n\r\n";

        split(input, &mut sink).unwrap();

        assert_eq!(sink.headers,
                   lines(&["Set-Cookie: a=1", "Set-Cookie: b=2", "not even a header"]));
        assert!(sink.body.is_empty());
    }

    #[test]
    fn no_headers_at_all() {
        let mut sink = Collected::default();
        split(&b"\r\nonly body"[..], &mut sink).unwrap();
        assert!(sink.headers.is_empty());
        assert_eq!(sink.body, b"only body");
    }

    #[test]
    fn premature_end_forwards_nothing() {
        let mut sink = Collected::default();
        let input: &[u8] = b"Content-Type: text/plain\r\n";

        match split(input, &mut sink) {
            Err(Error::PrematureEndOfHeaders) => (),
            other => panic!("{:?}", other)
        }
        assert!(sink.headers.is_empty());
        assert!(sink.body.is_empty());
    }

    #[test]
    fn empty_output_is_premature() {
        let mut sink = Collected::default();
        match split(&b""[..], &mut sink) {
            Err(Error::PrematureEndOfHeaders) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn unterminated_last_line_is_premature() {
        let mut splitter = Splitter::new(&b"A: 1\r\nB: 2"[..]);
        match splitter.headers() {
            Err(Error::PrematureEndOfHeaders) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn binary_body_survives_small_buffers() {
        let mut input = Vec::from(&b"Content-Type: application/octet-stream\r\n\r\n"[..]);
        let body: Vec<u8> = (0 .. 2 * CHUNK_SIZE + 5).map(|i| (i % 256) as u8).collect();
        input.extend_from_slice(&body);

        let mut sink = Collected::default();
        let forwarded = split(BufReader::with_capacity(7, &input[..]), &mut sink).unwrap();

        assert_eq!(sink.body, body);
        assert_eq!(forwarded.bytes, body.len() as u64);
    }

    struct Failing<'a> {
        first: &'a [u8]
    }

    impl<'a> Read for Failing<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.first.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "pipe broke"));
            }
            let n = self.first.read(buf)?;
            Ok(n)
        }
    }

    #[test]
    fn read_error_in_body_truncates() {
        let reader = BufReader::new(Failing { first: b"A: 1\n\nsome" });
        let mut sink = Collected::default();

        let forwarded = split(reader, &mut sink).unwrap();

        assert_eq!(sink.headers, lines(&["A: 1"]));
        assert_eq!(sink.body, b"some");
        assert!(forwarded.error.is_some());
    }

    #[test]
    fn read_error_in_headers_is_fatal() {
        let reader = BufReader::new(Failing { first: b"A: 1\n" });
        let mut sink = Collected::default();

        match split(reader, &mut sink) {
            Err(Error::Read(_)) => (),
            other => panic!("{:?}", other)
        }
        assert!(sink.headers.is_empty());
    }
}
