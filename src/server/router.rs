//! A dead-simple router implementation
//!
//! A `Router` simply matches a request path against installed routes, in the
//! order they have been added, dispatching to the first handler that matches.
//! Matching is by whole path segments, so `/cgi-bin` does not match
//! `/cgi-binary`.

use crate::errors::*;
use crate::filesystem::split_query;
use crate::server::{Handler, Request, Response, Fresh};
use crate::server::error_messages::*;

use log::warn;

use std::path::{Path, PathBuf};

pub struct Router {
    routes: Vec<Route>
}

struct Route {
    path: PathBuf,
    handler: Box<dyn Handler>
}

impl Router {
    /// Index of the route that covers `target`, if any
    fn position(&self, target: &str) -> Option<usize> {
        let (path, _) = split_query(target);
        let request_path = Path::new(path);

        self.routes.iter().position(|route| request_path.starts_with(&route.path))
    }

    fn serve_inner(&self, req: Request, res: Response<Fresh>) -> Result<()> {
        match self.position(req.target()) {
            Some(i) => self.routes[i].handler.serve(req, res),
            None => error_404(res)?
        }

        Ok(())
    }

    /// Initialize a new, empty router
    pub fn new() -> Router {
        Router { routes: Vec::new() }
    }

    /// Create a route that will invoke the given `handler` for all methods
    pub fn route<H: Handler + 'static>(&mut self, path: PathBuf, handler: H) {
        self.routes.push(Route {
            path: path,
            handler: Box::new(handler)
        });
    }
}

impl Handler for Router {
    fn serve(&self, req: Request, res: Response<Fresh>) {
        match self.serve_inner(req, res) {
            Ok(_) => (),
            Err(e) => warn!("Error serving a request: {}", e)
        }
    }
}
