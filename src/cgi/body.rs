//! Rebuilding the request body a CGI program reads from stdin
//!
//! Non-multipart bodies are handed over untouched. Multipart bodies have
//! already been taken apart by the host, so they are put back together from
//! the decoded fields and uploads: text fields first, then files, then the
//! closing boundary. CGI programs must not depend on part order, so the
//! reordering is harmless, but anything else the client sent per part
//! (charsets, transfer encodings, extra part headers) is lost.

use crate::cgi::parser::multipart_boundary;
use crate::request::{ParsedRequest, UploadedFile};

use std::borrow::Cow;
use std::io::{self, Read, Write};

/// Bytes moved per read when streaming a body or an upload
pub const CHUNK_SIZE: usize = 4096;

/// Content type sent for uploads that did not arrive intact
pub const FALLBACK_TYPE: &str = "application/octet-stream";

/// How the body is sent to the child
#[derive(Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Nothing is written; stdin is closed straight away
    Empty,
    /// The raw request body, byte for byte
    Raw,
    /// A synthesized `multipart/form-data` stream. The delimiter already
    /// carries its leading `--`.
    Multipart { delimiter: String }
}

impl Encoding {
    pub fn of(req: &ParsedRequest) -> Encoding {
        if !req.is_post() {
            return Encoding::Empty;
        }

        match multipart_boundary(&req.content_type) {
            Some(token) => Encoding::Multipart { delimiter: format!("--{}", token) },
            None => Encoding::Raw
        }
    }
}

/// Replaces every `"` with `\"`. Nothing else is escaped.
pub fn escape_quotes(s: &str) -> Cow<str> {
    if s.contains('"') {
        Cow::Owned(s.replace('"', "\\\""))
    }
    else {
        Cow::Borrowed(s)
    }
}

fn field_head(delimiter: &str, name: &str) -> String {
    format!("{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n",
            delimiter, escape_quotes(name))
}

fn file_head(delimiter: &str, file: &UploadedFile) -> String {
    let content_type = if file.status.is_ok() {
        &file.content_type[..]
    }
    else {
        FALLBACK_TYPE
    };

    format!("{}\r\nContent-Disposition: form-data; name=\"{}\"; \
             filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            delimiter, escape_quotes(&file.field),
            escape_quotes(&file.filename), content_type)
}

fn terminator(delimiter: &str) -> String {
    format!("{}--\r\n", delimiter)
}

/// Copies `source` into `sink` one bounded chunk at a time.
pub fn copy_chunked<R: Read, W: Write>(mut source: R, mut sink: W)
                                       -> io::Result<u64>
{
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut copied = 0;
    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e)
        };

        sink.write_all(&buffer[.. read])?;
        copied += read as u64;
    }
}

/// Writes the body for `req` to `sink`, returning the number of bytes
/// written.
///
/// Exactly one encoding is used per request, chosen by [`Encoding::of`].
pub fn write_body<W: Write>(req: &ParsedRequest, mut sink: W) -> io::Result<u64> {
    let written = match Encoding::of(req) {
        Encoding::Empty => 0,
        Encoding::Raw => copy_chunked(req.body.open()?, &mut sink)?,
        Encoding::Multipart { delimiter } => write_multipart(req, &delimiter, &mut sink)?
    };

    sink.flush()?;
    Ok(written)
}

fn write_multipart<W: Write>(req: &ParsedRequest, delimiter: &str, mut sink: W)
                             -> io::Result<u64>
{
    let mut written = 0;

    for &(ref name, ref value) in &req.fields {
        let head = field_head(delimiter, name);
        sink.write_all(head.as_bytes())?;
        sink.write_all(value.as_bytes())?;
        sink.write_all(b"\r\n")?;
        written += (head.len() + value.len() + 2) as u64;
    }

    for file in &req.files {
        let head = file_head(delimiter, file);
        sink.write_all(head.as_bytes())?;
        written += head.len() as u64;
        written += copy_chunked(file.source.open()?, &mut sink)?;
        sink.write_all(b"\r\n")?;
        written += 2;
    }

    let end = terminator(delimiter);
    sink.write_all(end.as_bytes())?;
    written += end.len() as u64;

    Ok(written)
}

/// The exact number of bytes [`write_body`] would write for `req`.
///
/// Uploaded files are measured, not read.
pub fn reconstructed_length(req: &ParsedRequest) -> io::Result<u64> {
    match Encoding::of(req) {
        Encoding::Empty => Ok(0),
        Encoding::Raw => req.body.len(),
        Encoding::Multipart { delimiter } => {
            let mut length = 0;
            for &(ref name, ref value) in &req.fields {
                length += (field_head(&delimiter, name).len() + value.len() + 2) as u64;
            }
            for file in &req.files {
                length += file_head(&delimiter, file).len() as u64;
                length += file.source.len()? + 2;
            }
            Ok(length + terminator(&delimiter).len() as u64)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{ByteSource, UploadStatus};

    use std::io::Write;

    fn post(content_type: &str) -> ParsedRequest {
        let mut req = ParsedRequest::new("POST");
        req.content_type = content_type.to_owned();
        req
    }

    fn body_of(req: &ParsedRequest) -> Vec<u8> {
        let mut out = Vec::new();
        let written = write_body(req, &mut out).unwrap();
        assert_eq!(written, out.len() as u64);
        assert_eq!(reconstructed_length(req).unwrap(), written);
        out
    }

    fn upload(field: &str, filename: &str, content_type: &str, bytes: &[u8])
              -> UploadedFile {
        UploadedFile {
            field: field.to_owned(),
            filename: filename.to_owned(),
            content_type: content_type.to_owned(),
            status: UploadStatus::Ok,
            source: ByteSource::Memory(Vec::from(bytes))
        }
    }

    #[test]
    fn get_sends_nothing() {
        let mut req = ParsedRequest::new("GET");
        req.body = ByteSource::Memory(Vec::from(&b"ignored"[..]));
        assert_eq!(Encoding::of(&req), Encoding::Empty);
        assert!(body_of(&req).is_empty());
    }

    #[test]
    fn urlencoded_passes_through() {
        let mut req = post("application/x-www-form-urlencoded");
        req.body = ByteSource::Memory(Vec::from(&b"a=1&b=2"[..]));
        assert_eq!(body_of(&req), b"a=1&b=2");
    }

    #[test]
    fn raw_body_keeps_binary_bytes() {
        let bytes: Vec<u8> = (0 .. 3 * CHUNK_SIZE + 17).map(|i| (i % 256) as u8).collect();
        let mut req = post("application/octet-stream");
        req.body = ByteSource::Memory(bytes.clone());
        assert_eq!(body_of(&req), bytes);
    }

    #[test]
    fn raw_body_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x00\xff\xfe binary \r\n\x00").unwrap();

        let mut req = post("text/plain");
        req.body = ByteSource::File(file.path().to_owned());
        assert_eq!(body_of(&req), b"\x00\xff\xfe binary \r\n\x00");
    }

    #[test]
    fn single_field() {
        let mut req = post("multipart/form-data; boundary=XYZ");
        req.fields.push(("q".to_owned(), "hello world".to_owned()));

        assert_eq!(
            body_of(&req),
            &b"--XYZ\r\nContent-Disposition: form-data; name=\"q\"\r\n\r\nhello world\r\n--XYZ--\r\n"[..]
        );
    }

    #[test]
    fn empty_form_is_only_the_terminator() {
        let req = post("multipart/form-data; boundary=XYZ");
        assert_eq!(body_of(&req), b"--XYZ--\r\n");
    }

    #[test]
    fn fields_then_files_then_terminator() {
        let mut req = post("multipart/form-data; boundary=b0undary");
        req.files.push(upload("doc", "a.bin", "application/x-thing", b"\x00\x01\r\n\x02"));
        req.fields.push(("first".to_owned(), "1".to_owned()));
        req.fields.push(("second".to_owned(), "two\r\nlines".to_owned()));

        let expected: &[u8] = b"--b0undary\r\n\
Content-Disposition: form-data; name=\"first\"\r\n\r\n1\r\n\
--b0undary\r\n\
Content-Disposition: form-data; name=\"second\"\r\n\r\ntwo\r\nlines\r\n\
--b0undary\r\n\
Content-Disposition: form-data; name=\"doc\"; filename=\"a.bin\"\r\n\
Content-Type: application/x-thing\r\n\r\n\x00\x01\r\n\x02\r\n\
--b0undary--\r\n";

        assert_eq!(body_of(&req), expected);
    }

    #[test]
    fn quotes_are_escaped_in_names_only() {
        let mut req = post("multipart/form-data; boundary=X");
        req.fields.push(("say \"hi\"".to_owned(), "\"quoted\"".to_owned()));
        req.files.push(upload("f\"", "my \"file\".txt", "text/plain", b"x"));

        let body = String::from_utf8(body_of(&req)).unwrap();
        assert!(body.contains("name=\"say \\\"hi\\\"\"\r\n\r\n\"quoted\"\r\n"));
        assert!(body.contains("name=\"f\\\"\"; filename=\"my \\\"file\\\".txt\""));
    }

    #[test]
    fn failed_upload_gets_fallback_type() {
        let mut req = post("multipart/form-data; boundary=X");
        let mut file = upload("f", "evil.html", "text/html", b"");
        file.status = UploadStatus::TooLarge;
        req.files.push(file);

        let body = String::from_utf8(body_of(&req)).unwrap();
        assert!(body.contains("filename=\"evil.html\"\r\nContent-Type: application/octet-stream\r\n\r\n\r\n"));
        assert!(!body.contains("text/html"));
    }

    #[test]
    fn large_upload_from_disk() {
        let bytes: Vec<u8> = (0 .. 5 * CHUNK_SIZE + 3).map(|i| (i * 7 % 251) as u8).collect();
        let mut spool = tempfile::NamedTempFile::new().unwrap();
        spool.write_all(&bytes).unwrap();

        let mut req = post("multipart/form-data; boundary=X");
        let mut file = upload("f", "big", "application/octet-stream", b"");
        file.source = ByteSource::File(spool.path().to_owned());
        req.files.push(file);

        let body = body_of(&req);
        let head = b"--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"big\"\r\nContent-Type: application/octet-stream\r\n\r\n";
        assert_eq!(&body[.. head.len()], &head[..]);
        assert_eq!(&body[head.len() .. head.len() + bytes.len()], &bytes[..]);
        assert_eq!(&body[head.len() + bytes.len() ..], b"\r\n--X--\r\n");
    }

    #[test]
    fn missing_upload_source_is_an_error() {
        let mut req = post("multipart/form-data; boundary=X");
        let mut file = upload("f", "gone", "text/plain", b"");
        file.source = ByteSource::File("/nonexistent/cgi-bridge/upload".into());
        req.files.push(file);

        assert!(write_body(&req, Vec::new()).is_err());
    }

    #[test]
    fn non_post_multipart_is_empty() {
        let mut req = post("multipart/form-data; boundary=X");
        req.method = "PUT".to_owned();
        req.fields.push(("a".to_owned(), "b".to_owned()));
        assert_eq!(Encoding::of(&req), Encoding::Empty);
    }
}
