pub mod parser;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// A holder for app configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port number to listen on
    pub port: u16,
    pub cgi: CgiConfig,
    pub limits: Limits,
    pub uploads: UploadConfig
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8000,
            cgi: Default::default(),
            limits: Default::default(),
            uploads: Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CgiConfig {
    /// Where the scripts are located on disk
    pub root: PathBuf,
    /// Public URI prefix that gets mapped onto `root`
    pub public_prefix: PathBuf,
    /// Program to run scripts with, if they are not executable themselves
    pub interpreter: Option<PathBuf>,
    pub timeout: Option<Duration>
}

impl Default for CgiConfig {
    fn default() -> CgiConfig {
        CgiConfig {
            root: PathBuf::from("/usr/lib/cgi-bin"),
            public_prefix: PathBuf::from("/cgi-bin"),
            interpreter: None,
            timeout: None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    /// Largest request body accepted, in bytes
    pub max_body: u64,
    /// Largest single upload kept, in bytes
    pub max_upload: u64
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_body: 8 * 1024 * 1024,
            max_upload: 2 * 1024 * 1024
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Where uploaded files are spooled while a request runs
    pub dir: PathBuf
}

impl Default for UploadConfig {
    fn default() -> UploadConfig {
        UploadConfig { dir: env::temp_dir() }
    }
}
