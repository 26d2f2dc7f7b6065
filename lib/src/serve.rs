//! Serving the archive repository over HTTP so a device can pull from it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// A static file server for one directory, running on a background task.
#[derive(Debug)]
pub struct RepoServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::result::Result<(), hyper::Error>>,
}

/// Map a request path to a relative path inside the served directory.
fn relative_path(uri_path: &str) -> Option<Utf8PathBuf> {
    let p = Utf8Path::new(uri_path.trim_start_matches('/'));
    let mut r = Utf8PathBuf::new();
    for c in p.components() {
        match c {
            Utf8Component::Normal(c) => r.push(c),
            Utf8Component::CurDir => {}
            _ => return None,
        }
    }
    (!r.as_str().is_empty()).then_some(r)
}

fn status(code: StatusCode) -> Response<Body> {
    let mut r = Response::new(Body::empty());
    *r.status_mut() = code;
    r
}

async fn serve_file(
    dir: Arc<Dir>,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return Ok(status(StatusCode::METHOD_NOT_ALLOWED));
    }
    let Some(path) = relative_path(req.uri().path()) else {
        return Ok(status(StatusCode::NOT_FOUND));
    };
    let head = *req.method() == Method::HEAD;
    let contents = tokio::task::spawn_blocking(move || match dir.metadata(&path) {
        Ok(m) if m.is_file() => dir.read(&path).map(Some),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    })
    .await;
    let r = match contents {
        Ok(Ok(Some(buf))) => {
            let len = buf.len();
            let body = if head { Body::empty() } else { Body::from(buf) };
            let mut r = Response::new(body);
            if let Ok(v) = len.to_string().parse() {
                r.headers_mut().insert(hyper::header::CONTENT_LENGTH, v);
            }
            r
        }
        Ok(Ok(None)) => status(StatusCode::NOT_FOUND),
        Ok(Err(e)) => {
            tracing::debug!("Serving {}: {e}", req.uri().path());
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => status(StatusCode::INTERNAL_SERVER_ERROR),
    };
    tracing::trace!("{} {} -> {}", req.method(), req.uri().path(), r.status());
    Ok(r)
}

impl RepoServer {
    /// Start serving `root` on `addr`; use port 0 to pick a free port.
    /// Must be called from within a tokio runtime.
    pub fn start(root: &Utf8Path, addr: SocketAddr) -> Result<Self> {
        let dir = Dir::open_ambient_dir(root, cap_std::ambient_authority())
            .map_err(Error::io_at(root))?;
        let dir = Arc::new(dir);
        let make_svc = make_service_fn(move |_conn| {
            let dir = Arc::clone(&dir);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_file(Arc::clone(&dir), req)))
            }
        });
        let server = hyper::Server::try_bind(&addr)
            .map_err(|e| Error::Transport(format!("Serving {root} on {addr}: {e}")))?
            .serve(make_svc);
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let server = server.with_graceful_shutdown(async {
            let _ = rx.await;
        });
        let task = tokio::spawn(server);
        tracing::debug!("Serving {root} on {addr}");
        Ok(Self {
            addr,
            shutdown: Some(tx),
            task,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop serving and wait for the server task to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Transport(format!("HTTP server failed: {e}"))),
            Err(e) => Err(Error::InvariantViolation(format!("HTTP server task: {e}"))),
        }
    }
}
