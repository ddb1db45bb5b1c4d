//! Server functionality
//!
//! A small blocking HTTP/1.1 front end whose only job is to hand requests
//! under the CGI prefix to the bridge.

pub mod cgi_handler;
pub mod form;
pub mod router;

use crate::config::Config;
use crate::errors::{Result, Error};
use crate::server::cgi_handler::CgiHandler;
use crate::server::router::Router;

use log::{info, warn};

use std::fs::canonicalize;
use std::io::{self, Cursor, Read, Write, BufWriter};
use std::marker::PhantomData;
use std::net::{TcpListener, TcpStream, SocketAddr};
use std::slice;
use std::time::Duration;

/// Biggest request head we are willing to buffer
const MAX_HEAD: usize = 64 * 1024;

/// Binds the configured port and begins serving CGI scripts.
///
/// Connections are handled one at a time.
pub fn serve(mut config: Config) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    config.cgi.root = canonicalize(&config.cgi.root)?;

    let mut router = Router::new();
    router.route(config.cgi.public_prefix.clone(), CgiHandler::new(config.clone()));

    info!("Serving {} at {}", config.cgi.root.display(),
          config.cgi.public_prefix.display());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_connection(&router, stream) {
                    warn!("Error handling a connection: {}", e);
                }
            },
            Err(e) => {
                warn!("Failed connection: {}", e);
            }
        };
    }

    Ok(())
}

/// Serves one request on `stream`; a failure only affects this client.
fn handle_connection(router: &Router, stream: TcpStream) -> Result<()> {
    stream.set_read_timeout(Some(Duration::new(5, 0)))?;
    stream.set_write_timeout(Some(Duration::new(5, 0)))?;

    match make_request_pair(stream.try_clone()?) {
        Ok((req, res)) => router.serve(req, res),
        Err(Error::Parse(_)) | Err(Error::RequestIncomplete) =>
            error_messages::error_400(Response::new(stream))?,
        Err(Error::RequestLineTooLong) =>
            error_messages::error_431(Response::new(stream))?,
        Err(e) => return Err(e)
    }

    Ok(())
}

#[test]
fn one_bad_client_does_not_stop_the_next() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new();

    // Hangs up before sending anything; answering it may fail
    drop(TcpStream::connect(addr).unwrap());
    let (stream, _) = listener.accept().unwrap();
    let _ = handle_connection(&router, stream);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"GET /nowhere HTTP/1.1\r\n\r\n").unwrap();
    let (stream, _) = listener.accept().unwrap();
    handle_connection(&router, stream).unwrap();

    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

fn make_request_pair(stream: TcpStream) -> Result<(Request, Response<Fresh>)> {
    let peer_addr = stream.peer_addr()?;
    let local_port = stream.local_addr()?.port();
    let response_inner = stream.try_clone()?;
    let request_inner = stream;

    let response = Response::new(response_inner);

    let request = Request {
        inner: InnerRequest::parse(request_inner)?,
        remote_addr: peer_addr,
        local_port: local_port
    };

    Ok((request, response))
}

/// Values which can handle requests
pub trait Handler {
    fn serve(&self, req: Request, res: Response<Fresh>);
}

impl<F> Handler for F where F: Fn(Request, Response<Fresh>) {
    fn serve(&self, req: Request, res: Response<Fresh>) {
        self(req, res)
    }
}

/// An incoming request from the client
#[derive(Debug)]
pub struct Request {
    inner: InnerRequest<TcpStream>,
    pub remote_addr: SocketAddr,
    pub local_port: u16
}

/// Internal, generic version of a Request
///
/// This division is primarily useful for testing; tests can wrap a simple byte
/// buffer, and the public impls can be trivial wrappers specialized to a
/// network stream.
#[derive(Debug)]
struct InnerRequest<R> {
    method: String,
    target: String,
    headers: Headers,

    rest: io::Chain<Cursor<Vec<u8>>, R>
}

impl<R: Read> InnerRequest<R> {
    fn parse(mut stream: R) -> Result<InnerRequest<R>> {
        let (leftover, method, target, headers) = parse_inner(&mut stream)?;

        Ok(InnerRequest {
            method: method,
            target: target,
            headers: headers,
            rest: Cursor::new(leftover).chain(stream)
        })
    }

    /// Reads the body announced by `Content-Length`, refusing anything
    /// bigger than `limit`.
    fn read_body(&mut self, limit: u64) -> Result<Vec<u8>> {
        let length = match self.headers.get("Content-Length") {
            Some(value) => {
                let parsed = ::std::str::from_utf8(value).ok()
                    .and_then(|v| v.trim().parse::<u64>().ok());
                match parsed {
                    Some(n) => n,
                    None => return Err(Error::Parse(httparse::Error::HeaderValue))
                }
            },
            None => 0
        };

        if length > limit {
            return Err(Error::BodyTooLarge);
        }

        let mut body = vec![0; length as usize];
        match self.rest.read_exact(&mut body) {
            Ok(()) => Ok(body),
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof =>
                Err(Error::RequestIncomplete),
            Err(e) => Err(Error::from(e))
        }
    }
}

/// Reads until a full request head has arrived.
///
/// Returns whatever was read past the head along with the parsed pieces.
fn parse_inner<R: Read>(source: &mut R) -> Result<(Vec<u8>, String, String, Headers)> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let read = source.read(&mut chunk)?;
        if read == 0 {
            return Err(Error::RequestIncomplete);
        }
        buffer.extend_from_slice(&chunk[.. read]);

        let mut headers = [httparse::EMPTY_HEADER; 100];
        let mut req = httparse::Request::new(&mut headers);

        if let httparse::Status::Complete(bytes) = req.parse(&buffer)? {
            let mut parsed = Headers::new();
            for header in req.headers.iter() {
                parsed.append(header.name, Vec::from(header.value));
            }

            let method = String::from(req.method.unwrap_or(""));
            let target = String::from(req.path.unwrap_or(""));
            return Ok((buffer[bytes ..].to_vec(), method, target, parsed));
        }

        if buffer.len() > MAX_HEAD {
            return Err(Error::RequestLineTooLong);
        }
    }
}

#[test]
fn parse_request_basic() {
    let mut request: &[u8] = b"GET / HTTP/1.1\r\nHost: google.com\r\nUser-Agent: curl/7.47.1\r\nAccept: */*\r\n\r\n";

    let (rest, method, target, headers) = parse_inner(&mut request).unwrap();

    assert_eq!(method, "GET");
    assert_eq!(target, "/");
    assert!(rest.is_empty());
    assert_eq!(headers.get("host").unwrap(), b"google.com");
}

#[test]
fn parse_request_does_not_percent_decode() {
    let mut request: &[u8] = b"GET /%20?a=%20 HTTP/1.1\r\n\r\n";

    let (_, _, target, _) = parse_inner(&mut request).unwrap();

    assert_eq!(target, "/%20?a=%20");
}

#[test]
fn parse_request_fails_on_bad_bytes() {
    let mut request: &[u8] = b"GET /bogon\xff HTTP/1.1\r\n";

    assert!(parse_inner(&mut request).is_err());
}

#[test]
fn parse_request_incomplete() {
    let mut request: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n";

    match parse_inner(&mut request) {
        Err(Error::RequestIncomplete) => (),
        other => panic!("{:?}", other)
    }
}

#[test]
fn request_body_follows_head() {
    let request: &[u8] = b"POST /x HTTP/1.1\r\nContent-Length: 7\r\n\r\na=1&b=2trailing";

    let mut inner = InnerRequest::parse(request).unwrap();

    assert_eq!(inner.read_body(100).unwrap(), b"a=1&b=2");
}

#[test]
fn request_body_over_limit() {
    let request: &[u8] = b"POST /x HTTP/1.1\r\nContent-Length: 7\r\n\r\na=1&b=2";

    let mut inner = InnerRequest::parse(request).unwrap();

    match inner.read_body(6) {
        Err(Error::BodyTooLarge) => (),
        other => panic!("{:?}", other)
    }
}

#[test]
fn request_body_cut_short() {
    let request: &[u8] = b"POST /x HTTP/1.1\r\nContent-Length: 70\r\n\r\na=1";

    let mut inner = InnerRequest::parse(request).unwrap();

    match inner.read_body(100) {
        Err(Error::RequestIncomplete) => (),
        other => panic!("{:?}", other)
    }
}

impl Request {
    /// The request-target exactly as the client sent it
    #[inline]
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn read_body(&mut self, limit: u64) -> Result<Vec<u8>> {
        self.inner.read_body(limit)
    }
}

/// The response being constructed by a `Handler`
///
/// The type parameter represents where in the cycle this response is. When
/// `Status = Fresh`, nothing has been sent to the client, headers can be
/// modified, and if the entire response-body is available at once it’s
/// possible to write the response in one shot.
///
/// When `Status = Streaming`, headers have already been sent, and use of the
/// `io::Write` interface will buffer chunks (as in Transfer-Encoding: Chunked)
/// to be sent to the client as they become available. `finish` must be called
/// to send the last chunk.
pub struct Response<Status, W: Write = TcpStream> {
    writer: BufWriter<W>,
    buffer: Vec<u8>,
    status: ResponseStatus,
    headers: Headers,
    _status: PhantomData<Status>
}

/// A marker for `Response`, indicating nothing has been sent to the client
pub enum Fresh {}

/// A marker for `Response`, indicating headers have been sent and writes will
/// be sent in chunks
pub enum Streaming {}

struct ResponseStatus {
    code: u16,
    reason: String
}

/// An ordered list of HTTP headers
///
/// Names are case-normalized on input: the first word, and any words after a
/// hyphen, are capitalized, with all other letters lowercased. Repeated names
/// are kept as separate entries, in order.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>
}

fn normalize_header_name(name: &str) -> String {
    let lowercased = name.to_ascii_lowercase();
    let mut lower_chars = lowercased.chars();

    let mut normalized = String::with_capacity(lowercased.len());
    if let Some(ch) = lower_chars.next() {
        normalized.push(ch.to_ascii_uppercase());
    }
    else {
        return normalized;
    }

    let mut after_hyphen = false;
    for ch in lower_chars {
        if ch == '-' {
            after_hyphen = true;
            normalized.push(ch);
        }
        else if after_hyphen {
            normalized.push(ch.to_ascii_uppercase());
            after_hyphen = false;
        }
        else {
            normalized.push(ch);
        }
    }

    normalized
}

#[test]
fn normalize_content_type() {
    let expected = "Content-Type";
    assert_eq!(expected, &normalize_header_name("Content-Type"));
    assert_eq!(expected, &normalize_header_name("content-type"));
    assert_eq!(expected, &normalize_header_name("CONTENT-TYPE"));
    assert_eq!(expected, &normalize_header_name("cOnTeNt-TyPe"));
}

impl Headers {
    pub fn new() -> Headers {
        Headers { entries: Vec::new() }
    }

    /// Adds a header, keeping any already present under the same name
    pub fn append(&mut self, key: &str, value: Vec<u8>) {
        self.entries.push((normalize_header_name(key), value));
    }

    /// Replaces every header called `key` with a single one
    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        let name = normalize_header_name(key);
        self.entries.retain(|&(ref n, _)| *n != name);
        self.entries.push((name, value));
    }

    /// The first header called `key`
    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        let name = normalize_header_name(key);
        self.entries.iter().find(|&&(ref n, _)| *n == name).map(|&(_, ref v)| v)
    }

    pub fn iter(&self) -> slice::Iter<(String, Vec<u8>)> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a (String, Vec<u8>);
    type IntoIter = slice::Iter<'a, (String, Vec<u8>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[test]
fn headers_keep_duplicates() {
    let mut headers = Headers::new();
    headers.append("set-cookie", Vec::from(&b"a=1"[..]));
    headers.append("Set-Cookie", Vec::from(&b"b=2"[..]));

    let all: Vec<_> = headers.iter().map(|&(ref n, ref v)| (n.as_str(), &v[..])).collect();
    assert_eq!(all, vec![("Set-Cookie", &b"a=1"[..]), ("Set-Cookie", &b"b=2"[..])]);
    assert_eq!(headers.get("SET-COOKIE").unwrap(), b"a=1");

    headers.set("Set-Cookie", Vec::from(&b"c=3"[..]));
    assert_eq!(headers.iter().count(), 1);
}

impl<W: Write> Response<Fresh, W> {
    pub fn new(stream: W) -> Self {
        Response {
            writer: BufWriter::new(stream),
            buffer: Vec::new(),
            status: ResponseStatus {
                code: 200,
                reason: String::from("OK")
            },
            headers: Headers::new(),
            _status: PhantomData
        }
    }

    pub fn of_stream<R: Read>(mut self, mut stream: R) -> io::Result<()> {
        self.write_headers()?;
        io::copy(&mut stream, &mut self.writer)?;
        self.writer.flush()
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn set_status(&mut self, code: u16, reason: String) {
        self.status = ResponseStatus {
            code: code,
            reason: reason
        };
    }

    pub fn start(mut self) -> io::Result<Response<Streaming, W>> {
        self.headers.set("Transfer-Encoding", Vec::from(&b"chunked"[..]));
        self.write_headers()?;

        let Response { writer, status, headers, .. } = self;
        Ok(Response {
            writer: writer,
            buffer: Vec::with_capacity(4096),
            status: status,
            headers: headers,
            _status: PhantomData
        })
    }

    fn write_headers(&mut self) -> io::Result<()> {
        // Status line
        write!(self.writer, "HTTP/1.1 {} {}\r\n",
               self.status.code, self.status.reason)?;

        for &(ref header, ref content) in &self.headers {
            write!(self.writer, "{}: ", header)?;
            self.writer.write_all(content)?;
            self.writer.write_all(b"\r\n")?;
        }

        self.writer.write_all(b"\r\n")?;

        Ok(())
    }
}

impl<W: Write> Response<Streaming, W> {
    /// Writes a single chunk in the chunked transfer-encoding, clearing out
    /// all buffers.
    fn write_chunk(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        write_chunk_raw(&mut self.writer, self.buffer.as_slice())?;
        self.buffer.clear();
        Ok(())
    }

    /// Sends anything still buffered followed by the last chunk.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_chunk()?;
        self.writer.write_all(b"0\r\n\r\n")?;
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

fn write_chunk_raw<W: Write>(sink: &mut W, chunk_content: &[u8]) -> io::Result<()> {
    write!(sink, "{:x}\r\n", chunk_content.len())?;
    sink.write_all(chunk_content)?;
    sink.write_all(b"\r\n")?;
    sink.flush()
}

impl<W: Write> Write for Response<Streaming, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let buffer_cap_remaining = self.buffer.capacity() - self.buffer.len();

        if buf.len() > buffer_cap_remaining {
            if buf.len() > self.buffer.capacity() {
                self.write_chunk()?;
                write_chunk_raw(&mut self.writer, buf)?;
            }
            else {
                self.buffer.extend_from_slice(&buf[.. buffer_cap_remaining]);
                self.write_chunk()?;
                self.buffer.extend_from_slice(&buf[buffer_cap_remaining ..]);
            }
        }
        else {
            self.buffer.extend_from_slice(buf);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_chunk()?;
        self.writer.flush()
    }
}

#[test]
fn streaming_response_is_chunked() {
    let mut res = Response::new(Vec::new());
    res.set_status(201, String::from("Created"));
    res.headers_mut().append("X-One", Vec::from(&b"1"[..]));
    res.headers_mut().append("X-One", Vec::from(&b"2"[..]));

    let mut res = res.start().unwrap();
    res.write_all(b"hello").unwrap();
    let out = res.finish().unwrap();

    assert_eq!(String::from_utf8(out).unwrap(),
               "HTTP/1.1 201 Created\r\nX-One: 1\r\nX-One: 2\r\n\
                Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n");
}

#[test]
fn oversized_write_goes_straight_out() {
    let res = Response::new(Vec::new());
    let mut res = res.start().unwrap();
    let big = vec![b'x'; 5000];
    res.write_all(&big).unwrap();
    let out = res.finish().unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("\r\n\r\n1388\r\n"));
    assert!(text.ends_with("\r\n0\r\n\r\n"));
}

pub mod error_messages {
    use super::{Fresh, Response};

    use std::io::{self, Write};

    fn error_page<W: Write>(mut res: Response<Fresh, W>, code: u16, reason: &str,
                            message: &str) -> io::Result<()> {
        let page = format!("<!doctype html><html><head><title>Error</title></head>\
                            <body><h1>{}</h1><p>{}</p></body></html>",
                           reason, message);

        res.set_status(code, String::from(reason));
        {
            let headers = res.headers_mut();
            headers.set("Content-Type", Vec::from(&b"text/html"[..]));
            headers.set("Content-Length", page.len().to_string().into_bytes());
        }

        res.of_stream(page.as_bytes())
    }

    pub fn error_504<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 504, "Gateway Timeout",
                   "The script took too long to answer.")
    }

    pub fn error_502<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 502, "Bad Gateway",
                   "The script sent back something that isn't a CGI response.")
    }

    pub fn error_500<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 500, "Internal Error",
                   "Something went wrong on my side. There's nothing you can do; \
                    maybe come back later.")
    }

    pub fn error_431<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 431, "Request Header Fields Too Large",
                   "That's a lot of headers. Try sending fewer.")
    }

    pub fn error_413<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 413, "Payload Too Large",
                   "The request body is bigger than this server accepts.")
    }

    pub fn error_404<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 404, "Not Found", "I couldn't find that script. Sorry.")
    }

    pub fn error_403<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 403, "Forbidden",
                   "You don't have permission to run that. Sorry.")
    }

    pub fn error_400<W: Write>(res: Response<Fresh, W>) -> io::Result<()> {
        error_page(res, 400, "Bad Request",
                   "Your request had some kind of bad syntax. Are you using netcat?")
    }

    #[test]
    fn error_page_has_matching_length() {
        let mut out = Vec::new();
        error_404(Response::new(&mut out)).unwrap();

        let text = String::from_utf8(out).unwrap();
        let (head, body) = text.split_at(text.find("\r\n\r\n").unwrap() + 4);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
    }
}
