//! Driving one CGI child process from spawn to reap
//!
//! The child gets a piped stdin and stdout; stderr is inherited. The request
//! body is written from a scoped writer thread while the calling thread reads
//! stdout, so a child that answers before it has consumed its whole request
//! cannot wedge both sides on full pipes. The two sides share nothing but
//! the child's pipes; the reader only looks at whether the writer is done.
//!
//! Header lines are not handed on until the writer has finished cleanly.
//! Body bytes that show up before that are held in memory, up to
//! `PENDING_LIMIT`. Once the writer fails the rest of the output is read and
//! thrown away, and the request fails. A child that writes more than
//! `PENDING_LIMIT` while its request is still going in gets its headers
//! committed early; a write failure after that only marks the report
//! truncated. Whatever happens, stdin is closed and the child is reaped
//! before `run` returns.

use crate::cgi::{body, HeaderLine, Report, ResponseSink};
use crate::cgi::body::CHUNK_SIZE;
use crate::cgi::splitter::Splitter;
use crate::errors::{Error, Result};
use crate::request::ParsedRequest;

use log::{debug, error, warn};

use std::io::{self, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

/// How often a timed child is polled for exit once its output is drained
const REAP_POLL: Duration = Duration::from_millis(10);

/// Most body bytes held back while the request body is still being written
pub const PENDING_LIMIT: usize = 16 * CHUNK_SIZE;

/// Lifecycle of a child, as seen from the reading side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Running,
    InputClosed,
    Draining,
    Closed
}

/// Builds the command for `script`: either the script itself or
/// `interpreter script`. The child runs in the script's directory.
pub fn command(script: &Path, interpreter: Option<&Path>) -> Command {
    let mut command = match interpreter {
        Some(interpreter) => {
            let mut c = Command::new(interpreter);
            c.arg(script);
            c
        },
        None => Command::new(script)
    };

    if let Some(dir) = script.parent() {
        if !dir.as_os_str().is_empty() {
            command.current_dir(dir);
        }
    }

    command
}

/// A spawned child and the bits of it the reading side still holds
struct CgiProcess<'a> {
    child: &'a Mutex<Child>,
    state: State,
    timeout: Option<Duration>,
    timed_out: &'a AtomicBool
}

impl<'a> CgiProcess<'a> {
    fn advance(&mut self, to: State) {
        debug!("CGI child {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            debug!("Could not kill CGI child: {}", e);
        }
    }

    /// Waits for the child to exit. With a timeout, the lock is only held
    /// for polls so the watchdog can still get in and kill it.
    fn reap(&mut self) -> Option<ExitStatus> {
        let result = match self.timeout {
            None => {
                let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
                child.wait()
            },
            Some(_) => loop {
                {
                    let mut child = self.child.lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    match child.try_wait() {
                        Ok(Some(status)) => break Ok(status),
                        Ok(None) => (),
                        Err(e) => break Err(e)
                    }
                }
                thread::sleep(REAP_POLL);
            }
        };

        self.advance(State::Closed);
        match result {
            Ok(status) => {
                debug!("CGI child exited with {}", status);
                Some(status)
            },
            Err(e) => {
                warn!("Could not wait for CGI child: {}", e);
                None
            }
        }
    }

    fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// The error to report for a failure before headers went out
    fn failure(&self, e: Error) -> Error {
        match (self.timed_out(), self.timeout) {
            (true, Some(limit)) => Error::Timeout(limit),
            _ => e
        }
    }
}

fn join_writer(writer: ScopedJoinHandle<io::Result<u64>>) -> io::Result<u64> {
    match writer.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::Other,
                                     "request body writer panicked"))
    }
}

/// Spawns `command`, feeds it the body for `req`, and splits its output
/// into `sink`.
pub fn run(mut command: Command, req: &ParsedRequest, sink: &mut dyn ResponseSink,
           timeout: Option<Duration>) -> Result<Report>
{
    command.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(Error::Spawn)?;
    debug!("Spawned CGI child {}", child.id());

    let pipes = (child.stdin.take(), child.stdout.take());
    let (stdin, stdout) = match pipes {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Spawn(io::Error::new(io::ErrorKind::Other,
                                                   "child pipes missing")));
        }
    };

    let child = Mutex::new(child);
    let timed_out = AtomicBool::new(false);

    thread::scope(|scope| {
        let mut process = CgiProcess {
            child: &child,
            state: State::NotStarted,
            timeout: timeout,
            timed_out: &timed_out
        };
        process.advance(State::Running);

        let (stop_watchdog, stopped) = mpsc::channel::<()>();
        if let Some(limit) = timeout {
            let child = &child;
            let timed_out = &timed_out;
            scope.spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(limit) {
                    warn!("CGI child still running after {}s; killing it",
                          limit.as_secs());
                    timed_out.store(true, Ordering::SeqCst);
                    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                    let _ = child.kill();
                }
            });
        }

        let writer = if body::Encoding::of(req) == body::Encoding::Empty {
            drop(stdin);
            None
        }
        else {
            Some(scope.spawn(move || body::write_body(req, stdin)))
        };

        let result = exchange(&mut process, writer, stdout, sink);
        drop(stop_watchdog);
        result
    })
}

type Writer<'scope> = ScopedJoinHandle<'scope, io::Result<u64>>;

fn exchange(process: &mut CgiProcess, mut writer: Option<Writer>,
            stdout: ChildStdout, sink: &mut dyn ResponseSink) -> Result<Report>
{
    let mut splitter = Splitter::new(BufReader::new(stdout));

    let headers = match splitter.headers() {
        Ok(h) => h,
        Err(e) => {
            // Unblock a writer stuck on a child that is never going to read.
            process.kill();
            if let Some(writer) = writer {
                let _ = join_writer(writer);
            }
            drop(splitter);
            process.reap();
            return Err(process.failure(e));
        }
    };

    // Keep reading while the writer is busy, but hold on to the bytes.
    let mut pending = Vec::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    while writer.as_ref().map_or(false, |w| !w.is_finished()) {
        match splitter.read_chunk(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buffer[.. n]);
                if pending.len() >= PENDING_LIMIT {
                    debug!("Held {} body byte(s); committing before the request is in",
                           pending.len());
                    return commit(process, splitter, headers, pending, writer, sink);
                }
            },
            Err(e) => {
                process.kill();
                if let Some(writer) = writer.take() {
                    let _ = join_writer(writer);
                }
                drop(splitter);
                process.reap();
                return Err(process.failure(Error::Read(e)));
            }
        }
    }

    if let Some(writer) = writer {
        match join_writer(writer) {
            Ok(written) => debug!("Wrote {} request byte(s) to CGI child", written),
            Err(e) => {
                warn!("Writing request body to CGI child failed: {}", e);
                if let Err(e) = splitter.discard() {
                    debug!("Discarding CGI output failed: {}", e);
                }
                drop(splitter);
                process.reap();
                return Err(process.failure(Error::Write(e)));
            }
        }
    }
    process.advance(State::InputClosed);

    commit(process, splitter, headers, pending, None, sink)
}

/// Hands headers and body to `sink`. `writer` is set if the request body is
/// still being written.
fn commit(process: &mut CgiProcess, mut splitter: Splitter<BufReader<ChildStdout>>,
          headers: Vec<HeaderLine>, pending: Vec<u8>, writer: Option<Writer>,
          sink: &mut dyn ResponseSink) -> Result<Report>
{
    if let Err(e) = sink.headers(&headers) {
        drop(splitter);
        process.kill();
        if let Some(writer) = writer {
            let _ = join_writer(writer);
        }
        process.reap();
        return Err(Error::Io(e));
    }
    process.advance(State::Draining);

    let mut report = Report { status: None, body_bytes: 0, truncated: false };

    let mut early = Ok(());
    for chunk in pending.chunks(CHUNK_SIZE) {
        if let Err(e) = sink.body(chunk) {
            early = Err(e);
            break;
        }
        report.body_bytes += chunk.len() as u64;
    }

    match early {
        Ok(()) => {
            let forwarded = splitter.forward(sink);
            report.body_bytes += forwarded.bytes;
            if let Some(e) = forwarded.error {
                error!("CGI response body cut short after {} byte(s): {}",
                       report.body_bytes, e);
                report.truncated = true;
            }
        },
        Err(e) => {
            error!("Could not pass on CGI response body: {}", e);
            report.truncated = true;
        }
    }

    // Output that ended on its own was complete, whenever the child exits.
    let killed_while_draining = process.timed_out();

    // Closing stdout first means a child still writing gets EPIPE instead of
    // blocking forever.
    drop(splitter);

    if let Some(writer) = writer {
        if report.truncated {
            process.kill();
        }
        match join_writer(writer) {
            Ok(written) => debug!("Wrote {} request byte(s) to CGI child", written),
            Err(e) => {
                error!("Request body only partly reached CGI child: {}", e);
                report.truncated = true;
            }
        }
        process.advance(State::InputClosed);
    }

    report.status = process.reap();

    if killed_while_draining {
        error!("CGI response body cut short by timeout");
        report.truncated = true;
    }

    Ok(report)
}
