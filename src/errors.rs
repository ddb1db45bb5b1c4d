//! Error handling for the bridge and the host server

use std::error;
use std::fmt;
use std::io;
use std::time::Duration;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise within the application
#[derive(Debug)]
pub enum Error {
    /// The CGI program could not be started
    Spawn(io::Error),
    /// Feeding the request body to the CGI program failed
    Write(io::Error),
    /// The CGI program's output ended before the blank line closing its
    /// headers
    PrematureEndOfHeaders,
    /// Reading the CGI program's output failed before any header was sent on
    Read(io::Error),
    /// The CGI program ran longer than allowed and was killed
    Timeout(Duration),
    Parse(httparse::Error),
    Io(io::Error),
    RequestLineTooLong,
    PathNotInOriginForm,
    IllegalPercentEncoding,
    PermissionDenied,
    RequestIncomplete,
    BodyTooLarge,
    MalformedMultipart(&'static str)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Spawn(ref e) => write!(f, "could not start CGI program: {}", e),
            Error::Write(ref e) =>
                write!(f, "could not write request body to CGI program: {}", e),
            Error::PrematureEndOfHeaders =>
                write!(f, "premature end of CGI response headers"),
            Error::Read(ref e) =>
                write!(f, "could not read CGI program output: {}", e),
            Error::Timeout(d) =>
                write!(f, "CGI program exceeded {}s and was killed", d.as_secs()),
            Error::Parse(ref e) => write!(f, "malformed request: {}", e),
            Error::Io(ref e) => write!(f, "{}", e),
            Error::RequestLineTooLong => write!(f, "request line too long"),
            Error::PathNotInOriginForm =>
                write!(f, "request path is not in origin form"),
            Error::IllegalPercentEncoding =>
                write!(f, "illegal percent-encoding in request path"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::RequestIncomplete => write!(f, "request incomplete"),
            Error::BodyTooLarge => write!(f, "request body too large"),
            Error::MalformedMultipart(what) =>
                write!(f, "malformed multipart body: {}", what)
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Spawn(ref e) | Error::Write(ref e) | Error::Read(ref e)
                | Error::Io(ref e) => Some(e),
            Error::Parse(ref e) => Some(e),
            _ => None
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
