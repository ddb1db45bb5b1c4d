//! Handler that runs CGI scripts through the bridge
//!
//! A request under the public prefix is mapped onto a script below the CGI
//! root. Whatever follows the script in the path becomes `PATH_INFO`. The
//! request is decoded the way a typical host does it (cookies split, form
//! uploads spooled) and handed to a [`Bridge`]; the script's headers are
//! translated into an HTTP/1.1 response whose body is sent chunked.

use crate::cgi::{self, Bridge, Field, HeaderLine, Location, ResponseSink, Status};
use crate::cgi::body::reconstructed_length;
use crate::config::Config;
use crate::errors::*;
use crate::filesystem::{normalize_path, split_query};
use crate::log_util::ascii_escape;
use crate::request::{ByteSource, ParsedRequest};
use crate::server::{Handler, Headers, Request, Response, Fresh, Streaming, form};
use crate::server::error_messages::*;

use log::{debug, info, warn};

use std::ffi::OsStr;
use std::fs::{self, canonicalize};
use std::io::{self, ErrorKind, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const SERVER_SOFTWARE: &str = concat!("cgi-bridge/", env!("CARGO_PKG_VERSION"));

/// A handler for CGI scripts
pub struct CgiHandler {
    config: Config
}

/// Where a request-target landed below the CGI root
#[derive(Debug, PartialEq, Eq)]
struct Script {
    /// Canonical path of the script on disk
    path: PathBuf,
    /// Public path of the script, without any trailing path info
    name: String,
    /// Path following the script, with a leading `'/'`, or empty
    path_info: String
}

impl CgiHandler {
    pub fn new(config: Config) -> CgiHandler {
        CgiHandler { config: config }
    }

    /// Finds the script a request path refers to.
    ///
    /// Path segments are walked from the root; the first one that names a
    /// regular file is the script. Directories are never run.
    fn locate(&self, path: &str) -> Result<Script> {
        let decoded = normalize_path(path.as_bytes())?;
        let decoded = Path::new(OsStr::from_bytes(&decoded));

        let prefix = &self.config.cgi.public_prefix;
        let relative_prefix = prefix.strip_prefix("/").unwrap_or(prefix.as_path());
        let relative = match decoded.strip_prefix(relative_prefix) {
            Ok(r) => r,
            Err(_) => return Err(Error::Io(io::Error::from(ErrorKind::NotFound)))
        };

        let mut candidate = self.config.cgi.root.clone();
        let mut name = prefix.clone();
        let mut components = relative.components();

        while let Some(component) = components.next() {
            candidate.push(component);
            name.push(component);

            let meta = fs::metadata(&candidate)?;
            if meta.is_file() {
                let canonical = canonicalize(&candidate)?;
                if !canonical.starts_with(&self.config.cgi.root) {
                    return Err(Error::PermissionDenied);
                }

                let rest = components.as_path();
                let path_info = if rest.as_os_str().is_empty() {
                    String::new()
                }
                else {
                    format!("/{}", rest.to_string_lossy())
                };

                return Ok(Script {
                    path: canonical,
                    name: name.to_string_lossy().into_owned(),
                    path_info: path_info
                });
            }
            else if !meta.is_dir() {
                return Err(Error::PermissionDenied);
            }
        }

        Err(Error::PermissionDenied)
    }

    fn serve_inner(&self, mut req: Request, res: Response<Fresh>) -> Result<()> {
        let (path, query) = {
            let (path, query) = split_query(req.target());
            (path.to_owned(), query.to_owned())
        };

        let script = match self.locate(&path) {
            Ok(s) => s,
            Err(e) => return fail(e, res)
        };

        let body = match req.read_body(self.config.limits.max_body) {
            Ok(b) => b,
            Err(e) => return fail(e, res)
        };

        let content_type = req.headers().get("Content-Type")
            .map_or(String::new(), |v| String::from_utf8_lossy(v).trim().to_owned());

        let mut parsed = ParsedRequest::new(req.method());
        parsed.cookies = req.headers().iter()
            .filter(|&&(ref name, _)| name == "Cookie")
            .flat_map(|&(_, ref value)| form::parse_cookies(value))
            .collect();

        // Keeps spooled uploads on disk until the script is done
        let mut multipart = None;
        if parsed.is_post() {
            if let Some(boundary) = form::form_data_boundary(&content_type) {
                let mut decoded = match form::decode_multipart(
                    &body, &boundary, &self.config.limits, &self.config.uploads.dir
                ) {
                    Ok(d) => d,
                    Err(e) => return fail(e, res)
                };
                parsed.fields = mem::take(&mut decoded.fields);
                parsed.files = mem::take(&mut decoded.files);
                multipart = Some(decoded);
            }
        }

        parsed.content_type = content_type;
        parsed.body = ByteSource::Memory(body);
        parsed.server = match self.server_vars(&req, &script, &query, &parsed) {
            Ok(vars) => vars,
            Err(e) => return fail(e, res)
        };

        let mut bridge = Bridge::new(script.path.clone());
        if let Some(ref interpreter) = self.config.cgi.interpreter {
            bridge = bridge.interpreter(interpreter.clone());
        }
        if let Some(timeout) = self.config.cgi.timeout {
            bridge = bridge.timeout(timeout);
        }

        let outcome = respond(&bridge, &parsed, res);
        drop(multipart);

        let report = outcome?;
        info!("{} {} -> {} ({} bytes, {})", parsed.method, req.target(),
              script.path.display(), report.body_bytes,
              report.status.map_or(String::from("not reaped"), |s| s.to_string()));

        Ok(())
    }

    /// The server variables for one run of `script`
    fn server_vars(&self, req: &Request, script: &Script, query: &str,
                   parsed: &ParsedRequest) -> Result<Vec<(String, String)>>
    {
        let host = req.headers().get("Host")
            .map_or(String::new(), |h| String::from_utf8_lossy(h).into_owned());
        let server_name = match host.rfind(':') {
            Some(i) if !host.ends_with(']') => host[.. i].to_owned(),
            _ => host.clone()
        };
        let remote_addr = req.remote_addr.ip().to_string();

        let mut vars = Vec::new();
        {
            let mut push = |name: &str, value: String| vars.push((name.to_owned(), value));

            push("GATEWAY_INTERFACE", String::from("CGI/1.1"));
            push("SERVER_SOFTWARE", String::from(SERVER_SOFTWARE));
            push("SERVER_NAME", server_name);
            push("SERVER_PORT", req.local_port.to_string());
            push("SERVER_PROTOCOL", String::from("HTTP/1.1"));
            push("REQUEST_METHOD", parsed.method.clone());
            push("REQUEST_URI", req.target().to_owned());
            push("SCRIPT_NAME", script.name.clone());
            push("SCRIPT_FILENAME", script.path.to_string_lossy().into_owned());
            push("PATH_INFO", script.path_info.clone());
            if !script.path_info.is_empty() {
                let translated = self.config.cgi.root.join(&script.path_info[1 ..]);
                push("PATH_TRANSLATED", translated.to_string_lossy().into_owned());
            }
            push("QUERY_STRING", query.to_owned());
            push("REMOTE_ADDR", remote_addr.clone());
            push("REMOTE_HOST", remote_addr);
            if !parsed.content_type.is_empty() {
                push("CONTENT_TYPE", parsed.content_type.clone());
            }
            if parsed.is_post() {
                push("CONTENT_LENGTH", reconstructed_length(parsed)?.to_string());
            }
            push("DOCUMENT_ROOT", self.config.cgi.root.to_string_lossy().into_owned());
        }

        vars.extend(http_vars(req.headers()));
        Ok(vars)
    }
}

/// `HTTP_*` variables for the request headers, repeated headers joined with
/// `", "`.
///
/// `Content-Type` and `Content-Length` have their own variables and are left
/// out.
fn http_vars(headers: &Headers) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = Vec::new();

    for &(ref name, ref value) in headers {
        if name == "Content-Type" || name == "Content-Length" {
            continue;
        }

        let var = format!("HTTP_{}", name.replace('-', "_").to_ascii_uppercase());
        let value = String::from_utf8_lossy(value);
        match vars.iter_mut().find(|entry| entry.0 == var) {
            Some(entry) => {
                entry.1.push_str(", ");
                entry.1.push_str(&value);
            },
            None => vars.push((var, value.into_owned()))
        }
    }

    vars
}

/// Sends the error page matching `e` and hands `e` back.
fn fail<W: Write>(e: Error, res: Response<Fresh, W>) -> Result<()> {
    error_page_for(&e, res)?;
    Err(e)
}

fn error_page_for<W: Write>(e: &Error, res: Response<Fresh, W>) -> io::Result<()> {
    match *e {
        Error::Io(ref io) if io.kind() == ErrorKind::NotFound => error_404(res),
        Error::Io(ref io) if io.kind() == ErrorKind::PermissionDenied => error_403(res),
        Error::PermissionDenied => error_403(res),
        Error::PathNotInOriginForm | Error::IllegalPercentEncoding
            | Error::Parse(_) | Error::RequestIncomplete
            | Error::MalformedMultipart(_) => error_400(res),
        Error::BodyTooLarge => error_413(res),
        Error::PrematureEndOfHeaders | Error::Read(_) => error_502(res),
        Error::Timeout(_) => error_504(res),
        Error::Spawn(_) | Error::Write(_) | Error::Io(_)
            | Error::RequestLineTooLong => error_500(res)
    }
}

/// Runs `bridge` and relays its output as the response.
fn respond<W: Write>(bridge: &Bridge, parsed: &ParsedRequest, res: Response<Fresh, W>)
                     -> Result<cgi::Report>
{
    let mut relay = Relay { fresh: Some(res), streaming: None };

    match bridge.run(parsed, &mut relay) {
        Ok(report) => {
            if report.truncated {
                warn!("Output of {} was cut short", bridge.script().display());
            }
            if let Some(res) = relay.streaming.take() {
                res.finish()?;
            }
            Ok(report)
        },
        Err(e) => {
            if let Some(res) = relay.fresh.take() {
                error_page_for(&e, res)?;
            }
            Err(e)
        }
    }
}

/// A `ResponseSink` that turns CGI output into an HTTP response
struct Relay<W: Write> {
    fresh: Option<Response<Fresh, W>>,
    streaming: Option<Response<Streaming, W>>
}

impl<W: Write> ResponseSink for Relay<W> {
    fn headers(&mut self, lines: &[HeaderLine]) -> io::Result<()> {
        let mut res = match self.fresh.take() {
            Some(res) => res,
            None => return Err(io::Error::new(ErrorKind::Other, "headers already sent"))
        };

        translate(lines, &mut res);
        self.streaming = Some(res.start()?);
        Ok(())
    }

    fn body(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.streaming {
            Some(ref mut res) => res.write_all(chunk),
            None => Err(io::Error::new(ErrorKind::Other, "body before headers"))
        }
    }
}

/// Applies CGI header lines to a response that has not been sent yet.
///
/// `Status` sets the status line and a `Location` without one redirects with
/// 302. Lines that are not headers at all are dropped.
fn translate<W: Write>(lines: &[HeaderLine], res: &mut Response<Fresh, W>) {
    let mut has_status = false;
    let mut has_location = false;

    for line in lines {
        match line.field() {
            Some(Field::Status(Status { code, reason_phrase })) => {
                res.set_status(code, String::from_utf8_lossy(&reason_phrase).into_owned());
                has_status = true;
            },
            Some(Field::Location(Location { url })) => {
                res.headers_mut().append("Location", url);
                has_location = true;
            },
            Some(Field::Header(header)) => {
                let name = String::from_utf8_lossy(&header.name);
                if name.eq_ignore_ascii_case("Content-Length") {
                    // The body goes out chunked
                    debug!("Dropping Content-Length from CGI output");
                    continue;
                }
                res.headers_mut().append(&name, header.content);
            },
            None => warn!("Dropping malformed CGI header line {}",
                          ascii_escape(line.as_bytes()))
        }
    }

    if has_location && !has_status {
        res.set_status(302, String::from("Found"));
    }
}

impl Handler for CgiHandler {
    fn serve(&self, req: Request, res: Response<Fresh>) {
        if let Err(e) = self.serve_inner(req, res) {
            warn!("Error running CGI script: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn lines(raw: &[&str]) -> Vec<HeaderLine> {
        raw.iter().map(|l| HeaderLine(Vec::from(l.as_bytes()))).collect()
    }

    fn rendered(raw: &[&str]) -> String {
        let mut res = Response::new(Vec::new());
        translate(&lines(raw), &mut res);
        let out = res.start().unwrap().finish().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn plain_headers_pass_through() {
        let out = rendered(&["Content-Type: text/plain", "X-Thing: a b"]);
        assert_eq!(out, "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Thing: a b\r\n\
                         Transfer-Encoding: chunked\r\n\r\n0\r\n\r\n");
    }

    #[test]
    fn status_sets_status_line() {
        let out = rendered(&["Status: 404 Nope", "Content-Type: text/plain"]);
        assert!(out.starts_with("HTTP/1.1 404 Nope\r\n"));
        assert!(!out.contains("Status:"));
    }

    #[test]
    fn location_redirects() {
        let out = rendered(&["Location: /elsewhere"]);
        assert!(out.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(out.contains("Location: /elsewhere\r\n"));
    }

    #[test]
    fn location_keeps_explicit_status() {
        let out = rendered(&["Location: /elsewhere", "Status: 301 Moved Permanently"]);
        assert!(out.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
    }

    #[test]
    fn junk_and_content_length_dropped() {
        let out = rendered(&["no colon here", "Content-Length: 12", "X-Ok: 1"]);
        assert!(!out.contains("no colon"));
        assert!(!out.contains("Content-Length"));
        assert!(out.contains("X-Ok: 1\r\n"));
    }

    #[test]
    fn http_vars_join_repeats() {
        let mut headers = Headers::new();
        headers.append("Accept", Vec::from(&b"text/html"[..]));
        headers.append("x-forwarded-for", Vec::from(&b"10.0.0.1"[..]));
        headers.append("Accept", Vec::from(&b"*/*"[..]));
        headers.append("Content-Type", Vec::from(&b"text/plain"[..]));

        assert_eq!(http_vars(&headers), vec![
            ("HTTP_ACCEPT".to_owned(), "text/html, */*".to_owned()),
            ("HTTP_X_FORWARDED_FOR".to_owned(), "10.0.0.1".to_owned())
        ]);
    }

    fn executable(path: &Path, source: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(b"#!/bin/sh\n").unwrap();
        f.write_all(source.as_bytes()).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn handler(root: &TempDir) -> CgiHandler {
        let mut config = Config::default();
        config.cgi.root = canonicalize(root.path()).unwrap();
        CgiHandler::new(config)
    }

    #[test]
    fn locate_splits_path_info() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        executable(&root.path().join("sub/run.cgi"), "true\n");
        let handler = handler(&root);

        let script = handler.locate("/cgi-bin/sub/run.cgi/extra/bits").unwrap();
        assert_eq!(script.path, handler.config.cgi.root.join("sub/run.cgi"));
        assert_eq!(script.name, "/cgi-bin/sub/run.cgi");
        assert_eq!(script.path_info, "/extra/bits");

        let script = handler.locate("/cgi-bin//sub/run%2ecgi").unwrap();
        assert_eq!(script.name, "/cgi-bin/sub/run.cgi");
        assert_eq!(script.path_info, "");
    }

    #[test]
    fn locate_refuses() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        let handler = handler(&root);

        match handler.locate("/cgi-bin/missing.cgi") {
            Err(Error::Io(ref e)) if e.kind() == ErrorKind::NotFound => (),
            other => panic!("{:?}", other)
        }
        match handler.locate("/cgi-bin/sub") {
            Err(Error::PermissionDenied) => (),
            other => panic!("{:?}", other)
        }
        match handler.locate("/cgi-bin/../etc/passwd") {
            Err(Error::PermissionDenied) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn relays_script_output() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("hello.cgi");
        executable(&path, "printf 'Status: 201 Made\\r\\nX-Method: %s\\r\\n\\r\\n' \
                           \"$REQUEST_METHOD\"\nprintf 'hello'\n");

        let mut parsed = ParsedRequest::new("GET");
        parsed.server.push(("REQUEST_METHOD".to_owned(), "GET".to_owned()));
        let bridge = Bridge::new(path).ambient(Vec::new());

        let mut out = Vec::new();
        let report = respond(&bridge, &parsed, Response::new(&mut out)).unwrap();
        assert_eq!(report.body_bytes, 5);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 201 Made\r\n"));
        assert!(text.contains("X-Method: GET\r\n"));
        assert!(text.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }

    #[test]
    fn broken_script_gets_502() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("broken.cgi");
        executable(&path, "printf 'Content-Type: text/plain\\r\\n'\n");

        let bridge = Bridge::new(path).ambient(Vec::new());
        let mut out = Vec::new();
        match respond(&bridge, &ParsedRequest::new("GET"), Response::new(&mut out)) {
            Err(Error::PrematureEndOfHeaders) => (),
            other => panic!("{:?}", other)
        }
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[test]
    fn slow_script_gets_504() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("slow.cgi");
        executable(&path, "exec sleep 10\n");

        let bridge = Bridge::new(path).ambient(Vec::new())
            .timeout(Duration::from_millis(200));
        let mut out = Vec::new();
        match respond(&bridge, &ParsedRequest::new("GET"), Response::new(&mut out)) {
            Err(Error::Timeout(_)) => (),
            other => panic!("{:?}", other)
        }
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
    }
}
