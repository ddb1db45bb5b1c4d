//! The environment a CGI program starts with

use crate::request::ParsedRequest;

use log::debug;

use std::ffi::{OsStr, OsString};
use std::process::Command;

/// Set by any server that speaks CGI; if it is already present this process
/// is itself running under a CGI-aware invoker.
const CGI_MARKER: &str = "REQUEST_METHOD";
const COOKIE_VAR: &str = "HTTP_COOKIE";

/// Variables laid over the inherited environment of the child
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(OsString, OsString)>
}

impl Environment {
    pub fn vars(&self) -> &[(OsString, OsString)] {
        &self.vars
    }

    pub fn get<K: AsRef<OsStr>>(&self, name: K) -> Option<&OsStr> {
        let name = name.as_ref();
        self.vars.iter().rev()
            .find(|&&(ref k, _)| k == name)
            .map(|&(_, ref v)| v.as_os_str())
    }

    pub fn apply(&self, command: &mut Command) {
        command.envs(self.vars.iter().map(|&(ref k, ref v)| (k, v)));
    }
}

/// Works out the variables to add on top of `ambient` for `req`.
///
/// Server variables are copied verbatim unless `ambient` already holds a CGI
/// environment. Unless `ambient` carries its own `HTTP_COOKIE`, one is
/// synthesized from the decoded cookies and replaces any copied from the
/// server variables.
pub fn build<I>(ambient: I, req: &ParsedRequest) -> Environment
    where I: IntoIterator<Item = (OsString, OsString)>
{
    let mut inherited_cgi = false;
    let mut inherited_cookie = false;
    for (name, _) in ambient {
        if name == CGI_MARKER {
            inherited_cgi = true;
        }
        else if name == COOKIE_VAR {
            inherited_cookie = true;
        }
    }

    let mut env = Environment::default();

    if inherited_cgi {
        debug!("Inherited a CGI environment; not copying server variables");
    }
    else {
        for &(ref name, ref value) in &req.server {
            env.vars.push((OsString::from(name), OsString::from(value)));
        }
    }

    if !req.cookies.is_empty() && !inherited_cookie {
        env.vars.retain(|&(ref name, _)| name != COOKIE_VAR);
        env.vars.push((OsString::from(COOKIE_VAR),
                       OsString::from(cookie_header(&req.cookies))));
    }

    env
}

/// Percent-encodes every name and value and joins the pairs with `"; "`.
pub fn cookie_header(cookies: &[(String, String)]) -> String {
    cookies.iter()
        .map(|&(ref name, ref value)| format!("{}={}",
                                              urlencoding::encode(name),
                                              urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("; ")
}
