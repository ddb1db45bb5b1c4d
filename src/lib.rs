//! Run CGI/1.1 programs on behalf of a host that has already decoded the
//! request.
//!
//! The [`cgi`] module is the bridge proper: given a [`request::ParsedRequest`]
//! it rebuilds the environment and stdin a CGI program expects, runs the
//! program, and splits what it prints into header lines and a body. The
//! [`server`] module is a small HTTP/1.1 host built around it.

pub mod cgi;
pub mod config;
pub mod errors;
pub mod filesystem;
pub mod log_util;
pub mod request;
pub mod server;
