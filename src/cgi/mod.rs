//! Run a classic CGI/1.1 program on behalf of an already-decoded request
//!
//! The bridge rebuilds what a CGI program expects to see (environment
//! variables and a request body on stdin) from a [`ParsedRequest`], runs the
//! program once, and splits its stdout into header lines and a body.
//!
//! Two known limitations come along with rebuilding a request after the fact:
//!
//! * Multipart bodies are re-synthesized from decoded fields and files. The
//!   original part order, per-part charsets and transfer encodings are gone,
//!   and field values are not checked for the boundary token, so a value that
//!   contains it will confuse the child's parser.
//! * Writing stdin and reading stdout from one thread can deadlock when the
//!   child fills its stdout pipe before it has read all of stdin. The process
//!   driver avoids this by writing from a second thread; see [`process`].

pub mod body;
pub mod env;
pub mod parser;
pub mod process;
pub mod splitter;

use crate::errors::Result;
use crate::request::ParsedRequest;

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

/// A status line
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: Vec<u8>
}

/// A location redirect
#[derive(Debug, PartialEq, Eq)]
pub struct Location {
    pub url: Vec<u8>
}

/// Other headers
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub content: Vec<u8>
}

/// What a single CGI header line means to the server
#[derive(Debug, PartialEq, Eq)]
pub enum Field {
    Status(Status),
    Location(Location),
    Header(Header)
}

/// One header line exactly as the CGI program wrote it, minus the line
/// terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine(pub Vec<u8>);

impl HeaderLine {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Interprets the line as a status, location, or plain header.
    pub fn field(&self) -> Option<Field> {
        parser::field(&self.0).ok().map(|(_, f)| f)
    }
}

/// Receives the translated response
///
/// `headers` is called at most once, with every header line the program
/// wrote; `body` follows zero or more times. Nothing is sent if the program
/// broke the protocol before its headers were complete.
pub trait ResponseSink {
    fn headers(&mut self, lines: &[HeaderLine]) -> io::Result<()>;
    fn body(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// A sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct Collected {
    pub headers: Vec<HeaderLine>,
    pub body: Vec<u8>
}

impl ResponseSink for Collected {
    fn headers(&mut self, lines: &[HeaderLine]) -> io::Result<()> {
        self.headers.extend_from_slice(lines);
        Ok(())
    }

    fn body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

/// How a run finished, once headers have gone out
#[derive(Debug)]
pub struct Report {
    /// `None` if the child could not be waited on
    pub status: Option<ExitStatus>,
    pub body_bytes: u64,
    /// Something went wrong after headers went out: the body was cut short
    /// by a read error or the timeout, or the request body did not fully
    /// reach the child
    pub truncated: bool
}

/// Runs one CGI script per request
#[derive(Debug, Clone)]
pub struct Bridge {
    script: PathBuf,
    interpreter: Option<PathBuf>,
    timeout: Option<Duration>,
    ambient: Option<Vec<(OsString, OsString)>>
}

impl Bridge {
    pub fn new<P: Into<PathBuf>>(script: P) -> Bridge {
        Bridge {
            script: script.into(),
            interpreter: None,
            timeout: None,
            ambient: None
        }
    }

    /// Run the script as the sole argument of `interpreter`
    pub fn interpreter<P: Into<PathBuf>>(mut self, interpreter: P) -> Bridge {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Kill the child if it has not finished after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Bridge {
        self.timeout = Some(timeout);
        self
    }

    /// Use `vars` instead of this process's environment when deciding what
    /// the child already inherits
    pub fn ambient<I>(mut self, vars: I) -> Bridge
        where I: IntoIterator<Item = (OsString, OsString)>
    {
        self.ambient = Some(vars.into_iter().collect());
        self
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Runs the script for `req`, sending its response to `sink`.
    ///
    /// On `Err` nothing has been passed to `sink`.
    pub fn run(&self, req: &ParsedRequest, sink: &mut dyn ResponseSink)
               -> Result<Report>
    {
        let environment = match self.ambient {
            Some(ref vars) => env::build(vars.iter().cloned(), req),
            None => env::build(::std::env::vars_os(), req)
        };

        let mut command = process::command(&self.script,
                                           self.interpreter.as_ref()
                                               .map(PathBuf::as_path));
        environment.apply(&mut command);

        process::run(command, req, sink, self.timeout)
    }
}
