#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use poem::http::{header, StatusCode};
use poem::listener::TcpAcceptor;
use poem::error::ReadBodyError;
use poem::web::{Data, Path};
use poem::{get, handler, Body, Endpoint, EndpointExt, Request, Response, Route};
use tokio::sync::watch;
use log::{debug, error, info, warn};

use crate::services::forwarder::Forwarder;
use crate::utils::errors::Errors;
use crate::utils::form_utils::{self, RequestDebug};

// ***************************************************************************
//                                Constants
// ***************************************************************************
const HTML_CONTENT_TYPE: &str = "text/html";
const FALLBACK_CONTENT_TYPE: &str = "text/plain";
const MESSAGE_PATH: &str = "/message";

// Served when the page files are not installed.
const BUILTIN_INDEX_HTML: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Form</title></head>
<body>
<form action=\"/\" method=\"post\">
<label>Name <input name=\"name\"></label>
<label>Message <textarea name=\"message\"></textarea></label>
<button type=\"submit\">Send</button>
</form>
</body></html>
";
const BUILTIN_MESSAGE_HTML: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Thank you</title></head>
<body><p>Your message was sent.</p><p><a href=\"/\">Back</a></p></body></html>
";
const BUILTIN_ERROR_HTML: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Not found</title></head>
<body><p>The page you requested does not exist.</p><p><a href=\"/\">Home</a></p></body></html>
";
const INTERNAL_ERROR_HTML: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Server error</title></head>
<body><p>The requested file could not be read.</p></body></html>
";

// ***************************************************************************
//                                  Pages
// ***************************************************************************
#[derive(Debug, Clone, Copy)]
enum Page {
    Index,
    Message,
    Error,
}

impl Page {
    fn file_name(self) -> &'static str {
        match self {
            Page::Index => "index.html",
            Page::Message => "message.html",
            Page::Error => "error.html",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            Page::Index => BUILTIN_INDEX_HTML,
            Page::Message => BUILTIN_MESSAGE_HTML,
            Page::Error => BUILTIN_ERROR_HTML,
        }
    }
}

// ***************************************************************************
//                                 WebCtx
// ***************************************************************************
/** Everything the handlers need, attached to the routes as request data. */
#[derive(Debug, Clone)]
pub struct WebCtx {
    pages_dir: Arc<PathBuf>,
    static_dir: Arc<PathBuf>,
    forwarder: Forwarder,
    max_submission_bytes: usize,
}

impl WebCtx {
    pub fn new(pages_dir: PathBuf, static_dir: PathBuf, forwarder: Forwarder, max_submission_bytes: usize) -> Self {
        Self {
            pages_dir: Arc::new(pages_dir),
            static_dir: Arc::new(static_dir),
            forwarder,
            max_submission_bytes,
        }
    }
}

// Request body summary for debug logging.
struct SubmissionBody<'a>(&'a [u8]);

impl RequestDebug for SubmissionBody<'_> {
    fn get_request_info(&self) -> String {
        format!("  Request body ({} bytes): {}", self.0.len(), String::from_utf8_lossy(self.0))
    }
}

// ***************************************************************************
//                                 Routes
// ***************************************************************************
// ---------------------------------------------------------------------------
// build_routes:
// ---------------------------------------------------------------------------
/** The wildcard also matches `/` with an empty path, so the wildcard handlers
 * send an empty path to the landing page and the submission handler.
 */
pub fn build_routes(ctx: WebCtx) -> impl Endpoint<Output = Response> {
    Route::new()
        .at("/", get(index).post(submit))
        .at(MESSAGE_PATH, get(message))
        .at("/*path", get(static_file).post(submit_at))
        .data(ctx)
}

// ---------------------------------------------------------------------------
// run_web_front:
// ---------------------------------------------------------------------------
/** Serve on an already bound acceptor until shutdown is signalled, then give
 * in-flight requests up to the grace period to finish.
 */
pub async fn run_web_front(acceptor: TcpAcceptor,
                           ctx: WebCtx,
                           name: String,
                           mut shutdown: watch::Receiver<bool>,
                           grace: Duration)
    -> std::io::Result<()>
{
    info!("Web front forwarding submissions to {}.", ctx.forwarder.describe());
    let signal = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Web front shutting down.");
    };

    poem::Server::new_with_acceptor(acceptor)
        .name(name)
        .run_with_graceful_shutdown(build_routes(ctx), signal, Some(grace))
        .await
}

// ***************************************************************************
//                                Handlers
// ***************************************************************************
#[handler]
async fn index(req: &Request, Data(ctx): Data<&WebCtx>) -> Response {
    form_utils::debug_request(req, None);
    send_html_file(ctx, Page::Index, StatusCode::OK).await
}

#[handler]
async fn message(req: &Request, Data(ctx): Data<&WebCtx>) -> Response {
    form_utils::debug_request(req, None);
    send_html_file(ctx, Page::Message, StatusCode::OK).await
}

// ---------------------------------------------------------------------------
// static_file:
// ---------------------------------------------------------------------------
/** Serve a file below the static directory with a content type guessed from
 * its extension.  Anything that does not exist is a 404; something that
 * exists but cannot be read is a 500.  An empty path is the landing page.
 */
#[handler]
async fn static_file(req: &Request, Path(path): Path<String>, Data(ctx): Data<&WebCtx>) -> Response {
    form_utils::debug_request(req, None);

    if is_root(&path) {
        return send_html_file(ctx, Page::Index, StatusCode::OK).await;
    }

    let file = match form_utils::resolve_under(&ctx.static_dir, &path) {
        Some(f) if f.exists() => f,
        _ => {
            debug!("{}", Errors::NotFound(path));
            return send_html_file(ctx, Page::Error, StatusCode::NOT_FOUND).await;
        }
    };

    match tokio::fs::read(&file).await {
        Ok(bytes) => {
            let content_type = mime_guess::from_path(&file).first_raw().unwrap_or(FALLBACK_CONTENT_TYPE);
            Response::builder()
                .status(StatusCode::OK)
                .content_type(content_type)
                .body(bytes)
        },
        Err(e) => {
            error!("Unable to read static file {}: {}", file.display(), e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .content_type(HTML_CONTENT_TYPE)
                .body(INTERNAL_ERROR_HTML)
        },
    }
}

// ---------------------------------------------------------------------------
// submit:
// ---------------------------------------------------------------------------
/** Forward the raw form body to the ingest listener and redirect to the
 * confirmation page.  A failed forward is logged but the client is still
 * redirected; the submission is lost.
 */
#[handler]
async fn submit(req: &Request, body: Body, Data(ctx): Data<&WebCtx>) -> Response {
    accept_submission(req, body, ctx).await
}

/// POST through the wildcard route; only the root accepts submissions.
#[handler]
async fn submit_at(req: &Request, Path(path): Path<String>, body: Body, Data(ctx): Data<&WebCtx>) -> Response {
    if !is_root(&path) {
        debug!("POST to /{} refused, submissions go to /.", path);
        return Response::builder().status(StatusCode::METHOD_NOT_ALLOWED).finish();
    }
    accept_submission(req, body, ctx).await
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// accept_submission:
// ---------------------------------------------------------------------------
/** Read at most the submission limit from the body, forward it and redirect.
 * A body whose declared or streamed length goes past the limit is refused
 * with 413 without being buffered in full.
 */
async fn accept_submission(req: &Request, body: Body, ctx: &WebCtx) -> Response {
    let limit = ctx.max_submission_bytes;

    // Refuse early when the declared length is already too big.
    let declared = req.headers().get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = declared {
        if len > limit {
            return payload_too_large(Some(len), limit);
        }
    }

    let bytes = match body.into_bytes_limit(limit).await {
        Ok(b) => b,
        Err(ReadBodyError::PayloadTooLarge) => return payload_too_large(None, limit),
        Err(e) => {
            warn!("Unable to read submission body: {}", e);
            return Response::builder().status(StatusCode::BAD_REQUEST).finish();
        }
    };

    form_utils::debug_request(req, Some(&SubmissionBody(&bytes)));

    match ctx.forwarder.forward(&bytes).await {
        Ok(()) => debug!("Forwarded {} byte submission to {}.", bytes.len(), ctx.forwarder.describe()),
        Err(e) => error!("SUBMISSION LOST before ingest: {}", e),
    }

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, MESSAGE_PATH)
        .finish()
}

fn is_root(path: &str) -> bool {
    path.trim_matches('/').is_empty()
}

// ---------------------------------------------------------------------------
// send_html_file:
// ---------------------------------------------------------------------------
/** Serve one of the fixed pages.  When the installed page cannot be read the
 * built-in version is served with the same status.
 */
async fn send_html_file(ctx: &WebCtx, page: Page, status: StatusCode) -> Response {
    let path = ctx.pages_dir.join(page.file_name());
    let body: Body = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes.into(),
        Err(e) => {
            warn!("Unable to read page {}, serving built-in {}: {}", path.display(), page.file_name(), e);
            page.builtin().into()
        }
    };

    Response::builder()
        .status(status)
        .content_type(HTML_CONTENT_TYPE)
        .body(body)
}

// The length is unknown when a streamed body runs past the limit.
fn payload_too_large(len: Option<usize>, limit: usize) -> Response {
    match len {
        Some(len) => warn!("{}", Errors::PayloadTooLarge(len, limit)),
        None => warn!("Streamed submission refused after passing the {} byte limit.", limit),
    }
    Response::builder()
        .status(StatusCode::PAYLOAD_TOO_LARGE)
        .finish()
}
