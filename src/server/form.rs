//! Decoding cookies and `multipart/form-data` bodies the way a typical host
//! server does before it hands a request to the bridge
//!
//! Uploaded files are spooled into temporary files which live as long as the
//! returned `Multipart`.

use crate::config::Limits;
use crate::errors::{Error, Result};
use crate::request::{ByteSource, UploadStatus, UploadedFile};

use log::{debug, warn};
use mime::Mime;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_till, take_while, take_while1};
use nom::combinator::map;
use nom::multi::many0;
use nom::sequence::{delimited, preceded, separated_pair, tuple};
use tempfile::NamedTempFile;

use std::io::Write;
use std::path::Path;

/// Splits a `Cookie` header into percent-decoded name/value pairs.
pub fn parse_cookies(header: &[u8]) -> Vec<(String, String)> {
    header.split(|&b| b == b';')
        .map(trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut halves = pair.splitn(2, |&b| b == b'=');
            let name = halves.next().unwrap_or(&[]);
            let value = halves.next().unwrap_or(&[]);
            (percent_decode(trim(name)), percent_decode(trim(value)))
        })
        .collect()
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start .. end]
}

fn percent_decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(bytes)).into_owned()
}

/// The boundary of a `multipart/form-data` content type, however it is
/// spelled
pub fn form_data_boundary(content_type: &str) -> Option<String> {
    let mime: Mime = content_type.parse().ok()?;
    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        return None;
    }
    mime.get_param(mime::BOUNDARY).map(|b| b.as_str().to_owned())
}

/// A decoded multipart body
#[derive(Debug, Default)]
pub struct Multipart {
    pub fields: Vec<(String, String)>,
    pub files: Vec<UploadedFile>,
    spooled: Vec<NamedTempFile>
}

/// The parameters of a `Content-Disposition: form-data` header
#[derive(Debug, PartialEq, Eq)]
struct Disposition<'a> {
    name: Option<&'a str>,
    filename: Option<&'a str>
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(tag("\""), take_till(|c| c == '"'), tag("\""))(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != ';' && c != '"')(input)
}

fn parameter(input: &str) -> IResult<&str, (&str, &str)> {
    preceded(
        tuple((take_while(char::is_whitespace), tag(";"), take_while(char::is_whitespace))),
        separated_pair(token, tag("="), alt((quoted, token)))
    )(input)
}

fn disposition(input: &str) -> IResult<&str, Disposition> {
    map(
        preceded(tag_no_case("form-data"), many0(parameter)),
        |params| {
            let mut d = Disposition { name: None, filename: None };
            for (key, value) in params {
                if key.eq_ignore_ascii_case("name") {
                    d.name = Some(value);
                }
                else if key.eq_ignore_ascii_case("filename") {
                    d.filename = Some(value);
                }
            }
            d
        }
    )(input)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Decodes `body`, spooling uploads into `spool_dir`.
pub fn decode_multipart(body: &[u8], boundary: &str, limits: &Limits, spool_dir: &Path)
                        -> Result<Multipart>
{
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut separator = Vec::from(&b"\r\n"[..]);
    separator.extend_from_slice(&delimiter);

    let start = match find(body, &delimiter) {
        Some(i) => i + delimiter.len(),
        None => return Err(Error::MalformedMultipart("no opening boundary"))
    };

    let mut decoded = Multipart::default();
    let mut rest = &body[start ..];

    loop {
        if rest.starts_with(b"--") {
            return Ok(decoded);
        }
        if !rest.starts_with(b"\r\n") {
            return Err(Error::MalformedMultipart("junk after boundary"));
        }
        rest = &rest[2 ..];

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let (consumed, headers) = match httparse::parse_headers(rest, &mut headers)? {
            httparse::Status::Complete(parsed) => parsed,
            httparse::Status::Partial =>
                return Err(Error::MalformedMultipart("unterminated part headers"))
        };
        rest = &rest[consumed ..];

        let end = match find(rest, &separator) {
            Some(i) => i,
            None => return Err(Error::MalformedMultipart("no closing boundary"))
        };
        let content = &rest[.. end];
        rest = &rest[end + separator.len() ..];

        let mut disposition_header = None;
        let mut content_type = None;
        for header in headers.iter() {
            if header.name.eq_ignore_ascii_case("Content-Disposition") {
                disposition_header = Some(String::from_utf8_lossy(header.value).into_owned());
            }
            else if header.name.eq_ignore_ascii_case("Content-Type") {
                content_type = Some(String::from_utf8_lossy(header.value).trim().to_owned());
            }
        }

        let disposition_header = match disposition_header {
            Some(d) => d,
            None => {
                warn!("Skipping a multipart part without Content-Disposition");
                continue;
            }
        };
        let parsed = match disposition(disposition_header.trim()) {
            Ok((_, d)) => d,
            Err(_) => return Err(Error::MalformedMultipart("bad Content-Disposition"))
        };
        let name = match parsed.name {
            Some(name) => name.to_owned(),
            None => {
                warn!("Skipping an unnamed multipart part");
                continue;
            }
        };

        match parsed.filename {
            None => decoded.fields.push(
                (name, String::from_utf8_lossy(content).into_owned())
            ),
            Some(filename) => {
                let filename = filename.to_owned();
                let content_type = content_type.unwrap_or_else(|| {
                    mime_guess::from_path(&filename).first_or_octet_stream().to_string()
                });
                let file = decoded.spool(name, filename, content_type, content,
                                         limits, spool_dir);
                decoded.files.push(file);
            }
        }
    }
}

impl Multipart {
    fn spool(&mut self, field: String, filename: String, content_type: String,
             content: &[u8], limits: &Limits, spool_dir: &Path) -> UploadedFile
    {
        let mut file = UploadedFile {
            field: field,
            filename: filename,
            content_type: content_type,
            status: UploadStatus::Ok,
            source: ByteSource::empty()
        };

        if file.filename.is_empty() && content.is_empty() {
            file.status = UploadStatus::NoFile;
            return file;
        }

        if content.len() as u64 > limits.max_upload {
            debug!("Upload {:?} is {} bytes; limit is {}", file.filename,
                   content.len(), limits.max_upload);
            file.status = UploadStatus::TooLarge;
            return file;
        }

        let spooled = tempfile::Builder::new()
            .prefix("cgi-upload-")
            .tempfile_in(spool_dir)
            .and_then(|mut spool| {
                spool.write_all(content)?;
                spool.flush()?;
                Ok(spool)
            });

        match spooled {
            Ok(spool) => {
                file.source = ByteSource::File(spool.path().to_owned());
                self.spooled.push(spool);
            },
            Err(e) => {
                warn!("Could not spool upload {:?}: {}", file.filename, e);
                file.status = UploadStatus::CantWrite;
            }
        }

        file
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    fn limits(max_upload: u64) -> Limits {
        Limits { max_body: 1 << 20, max_upload: max_upload }
    }

    const FORM: &[u8] = b"preamble\r\n--AaB03x\r\n\
Content-Disposition: form-data; name=\"submit-name\"\r\n\r\n\
Larry\r\n\
--AaB03x\r\n\
Content-Disposition: form-data; name=\"files\"; filename=\"file1.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
... contents of file1.txt ...\r\n\
--AaB03x\r\n\
Content-Disposition: form-data; name=\"pic\"; filename=\"photo.png\"\r\n\r\n\
\x89PNG\r\n\x1a\n\r\n\
--AaB03x--\r\n";

    #[test]
    fn cookies() {
        assert_eq!(parse_cookies(b"a=1; b=two%20words;c=;  d=%E2%98%83 ;"),
                   vec![("a".to_owned(), "1".to_owned()),
                        ("b".to_owned(), "two words".to_owned()),
                        ("c".to_owned(), "".to_owned()),
                        ("d".to_owned(), "\u{2603}".to_owned())]);
        assert!(parse_cookies(b"").is_empty());
    }

    #[test]
    fn boundary_from_any_spelling() {
        assert_eq!(form_data_boundary("multipart/form-data; boundary=AaB03x"),
                   Some("AaB03x".to_owned()));
        assert_eq!(form_data_boundary("multipart/form-data;boundary=Q1x"),
                   Some("Q1x".to_owned()));
        assert_eq!(form_data_boundary("text/plain"), None);
        assert_eq!(form_data_boundary("multipart/mixed; boundary=x"), None);
    }

    #[test]
    fn disposition_params() {
        let (_, d) = disposition("form-data; name=\"a\"; filename=\"b c.txt\"").unwrap();
        assert_eq!(d.name.unwrap(), "a");
        assert_eq!(d.filename.unwrap(), "b c.txt");

        let (_, d) = disposition("form-data; name=plain").unwrap();
        assert_eq!(d.name.unwrap(), "plain");
        assert!(d.filename.is_none());
    }

    #[test]
    fn decodes_fields_and_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let form = decode_multipart(FORM, "AaB03x", &limits(1024), dir.path()).unwrap();

        assert_eq!(form.fields, vec![("submit-name".to_owned(), "Larry".to_owned())]);
        assert_eq!(form.files.len(), 2);

        let text = &form.files[0];
        assert_eq!(text.field, "files");
        assert_eq!(text.filename, "file1.txt");
        assert_eq!(text.content_type, "text/plain");
        assert_eq!(text.status, UploadStatus::Ok);
        match text.source {
            ByteSource::File(ref path) => {
                assert!(path.starts_with(dir.path()));
                assert_eq!(fs::read(path).unwrap(), b"... contents of file1.txt ...");
            },
            ref other => panic!("{:?}", other)
        }

        let png = &form.files[1];
        assert_eq!(png.content_type, "image/png");
        match png.source {
            ByteSource::File(ref path) =>
                assert_eq!(fs::read(path).unwrap(), b"\x89PNG\r\n\x1a\n"),
            ref other => panic!("{:?}", other)
        }
    }

    #[test]
    fn spooled_files_go_away_with_the_form() {
        let dir = tempfile::TempDir::new().unwrap();
        let form = decode_multipart(FORM, "AaB03x", &limits(1024), dir.path()).unwrap();
        let path = match form.files[0].source {
            ByteSource::File(ref path) => path.clone(),
            ref other => panic!("{:?}", other)
        };

        drop(form);
        assert!(!path.exists());
    }

    #[test]
    fn oversized_upload_is_marked() {
        let dir = tempfile::TempDir::new().unwrap();
        let form = decode_multipart(FORM, "AaB03x", &limits(8), dir.path()).unwrap();

        assert_eq!(form.files[0].status, UploadStatus::TooLarge);
        assert_eq!(form.files[0].source, ByteSource::empty());
        assert_eq!(form.files[1].status, UploadStatus::Ok);
    }

    #[test]
    fn empty_file_input() {
        let body = b"--x\r\nContent-Disposition: form-data; name=\"f\"; filename=\"\"\r\n\
Content-Type: application/octet-stream\r\n\r\n\r\n--x--\r\n";
        let dir = tempfile::TempDir::new().unwrap();
        let form = decode_multipart(body, "x", &limits(8), dir.path()).unwrap();

        assert_eq!(form.files[0].status, UploadStatus::NoFile);
    }

    #[test]
    fn missing_closing_boundary() {
        let body = b"--x\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue";
        let dir = tempfile::TempDir::new().unwrap();
        match decode_multipart(body, "x", &limits(8), dir.path()) {
            Err(Error::MalformedMultipart(_)) => (),
            other => panic!("{:?}", other)
        }
    }
}
