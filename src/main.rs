//! A small Web server that runs CGI scripts.
//!
//! Call it like this:
//!
//!     cgi-bridge -f config.toml
//!
//! The config file is in the [TOML format][toml]. Here is an example:
//!
//! ```toml
//! [listen]
//! port = 8000
//!
//! [cgi]
//! root = "/usr/lib/cgi-bin"
//! public_prefix = "/cgi-bin"
//! # interpreter = "/usr/bin/php-cgi"
//! # timeout = 30
//!
//! [limits]
//! max_body = 8388608
//! max_upload = 2097152
//!
//! [uploads]
//! dir = "/tmp"
//! ```
//!
//! Apart from the commented keys, this example also shows the defaults used
//! when a key is missing (`uploads.dir` defaults to the system temporary
//! directory). If a key is of the wrong type, the server will bail.
//!
//! Log verbosity is read from `SERVER_LOG`, using the usual `env_logger`
//! filter syntax.
//!
//! [toml]: https://github.com/toml-lang/toml

use cgi_bridge::config::parser::{self, parse_file};
use cgi_bridge::server::serve;

use clap::{value_parser, Arg, Command};
use log::{error, info, LevelFilter};

use std::env;
use std::path::PathBuf;
use std::process::exit;

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(LevelFilter::Info);

    if let Ok(var) = env::var("SERVER_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        eprintln!("cgi-bridge: Error when initializing logging: {}", e);
        exit(1);
    }

    let matches = Command::new("cgi-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Alex Hill <alexander.d.hill.89@gmail.com>")
        .arg(Arg::new("config_file")
             .short('f')
             .value_name("FILE")
             .help("The TOML file with server configuration")
             .value_parser(value_parser!(PathBuf)))
        .get_matches();

    let config_file = matches.get_one::<PathBuf>("config_file")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("/etc/cgi-bridge/config.toml"));

    let config = match parse_file(&config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Parse(e)) => {
            error!("Error parsing config file {:?} at {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Validation(message)) => {
            error!("Error in config file: {}", message);
            exit(1);
        }
    };

    info!("Starting server on port {}", config.port);
    if let Err(e) = serve(config) {
        error!("{}", e);
        exit(1);
    }
}
