use super::*;
use toml::{Table, Value};

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub fn parse_file<P: AsRef<Path>>(conf: P) -> Result<Config, Error> {
    let mut toml = String::new();
    {
        let mut f = File::open(conf)?;
        f.read_to_string(&mut toml)?;
    }

    parse_str(&toml)
}

pub fn parse_str(toml: &str) -> Result<Config, Error> {
    match toml.parse::<Table>() {
        Ok(table) => config_from_table(&table),
        Err(e) => Err(Error::Parse(message_from_error(toml, &e)))
    }
}

/// Looks up a dotted key like `"listen.port"`
fn lookup<'a>(table: &'a Table, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut value = table.get(parts.next()?)?;
    for part in parts {
        value = value.get(part)?;
    }
    Some(value)
}

fn string(table: &Table, key: &str, what: &str) -> Result<Option<String>, Error> {
    match lookup(table, key) {
        Some(&Value::String(ref s)) => Ok(Some(s.clone())),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be a string, got a {}", what, val.type_str())
        )),
        None => Ok(None)
    }
}

fn integer(table: &Table, key: &str, what: &str, min: i64, max: i64)
           -> Result<Option<i64>, Error>
{
    match lookup(table, key) {
        Some(&Value::Integer(n)) if n >= min && n <= max => Ok(Some(n)),
        Some(&Value::Integer(n)) => Err(Error::Validation(
            format!("{} {} is out of range", what, n)
        )),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be an integer, got a {}", what, val.type_str())
        )),
        None => Ok(None)
    }
}

fn config_from_table(table: &Table) -> Result<Config, Error> {
    let mut config: Config = Default::default();

    if let Some(p) = integer(table, "listen.port", "The port", 1, u16::MAX as i64)? {
        config.port = p as u16;
    }

    if let Some(root) = string(table, "cgi.root", "the CGI root")? {
        config.cgi.root = PathBuf::from(root);
    }

    if let Some(prefix) = string(table, "cgi.public_prefix", "the CGI prefix")? {
        if !prefix.starts_with('/') {
            return Err(Error::Validation(
                format!("The CGI prefix {:?} must start with '/'", prefix)
            ));
        }
        config.cgi.public_prefix = PathBuf::from(prefix);
    }

    if let Some(interpreter) = string(table, "cgi.interpreter", "the interpreter")? {
        config.cgi.interpreter = Some(PathBuf::from(interpreter));
    }

    if let Some(secs) = integer(table, "cgi.timeout", "The CGI timeout", 1, i64::MAX)? {
        config.cgi.timeout = Some(Duration::from_secs(secs as u64));
    }

    if let Some(n) = integer(table, "limits.max_body", "The body limit", 0, i64::MAX)? {
        config.limits.max_body = n as u64;
    }

    if let Some(n) = integer(table, "limits.max_upload", "The upload limit", 0, i64::MAX)? {
        config.limits.max_upload = n as u64;
    }

    if let Some(dir) = string(table, "uploads.dir", "the upload directory")? {
        config.uploads.dir = PathBuf::from(dir);
    }

    Ok(config)
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(ErrorMessage),
    Validation(String)
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// An owned, rendered version of a TOML syntax error
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {} column {}: {}", self.line, self.column, self.desc)
    }
}

/// Convert a `toml::de::Error` into an `ErrorMessage` with 1-based position
fn message_from_error(source: &str, error: &toml::de::Error) -> ErrorMessage {
    let offset = error.span().map_or(0, |span| span.start);
    let before = &source[.. offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |i| before.len() - i - 1) + 1;

    ErrorMessage {
        desc: error.message().to_owned(),
        line: line,
        column: column
    }
}
