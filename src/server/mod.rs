//! HTTP directory browser over a [`PathIndex`].
//!
//! `GET /` and `GET /<path>` render an HTML listing for directories and
//! stream content for files, with `Range` and conditional request support.
//! When credentials are configured every request must carry matching HTTP
//! Basic credentials; the check runs before the path is looked at, so an
//! unauthenticated client cannot tell which paths exist.

pub mod error;
mod handlers;
pub mod range;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ResultExt};
use crate::index::PathIndex;
use crate::reader::BlobReader;

pub use error::ServerError;

/// HTTP Basic credentials and the realm announced in the challenge.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
    realm: String,
}

impl BasicAuth {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
        }
    }

    /// Whether an `Authorization` header carries these credentials.
    pub fn check(&self, value: Option<&HeaderValue>) -> bool {
        let Some(encoded) = value
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
        else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Some(split) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        let (user, pass) = (&decoded[..split], &decoded[split + 1..]);
        let user_ok = user.ct_eq(self.username.as_bytes());
        let pass_ok = pass.ct_eq(self.password.as_bytes());
        (user_ok & pass_ok).into()
    }

    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.realm)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<PathIndex>,
    pub reader: BlobReader,
    pub auth: Option<Arc<BasicAuth>>,
    pub browse: bool,
}

impl AppState {
    pub fn new(index: Arc<PathIndex>, reader: BlobReader, browse: bool) -> Self {
        Self {
            index,
            reader,
            auth: None,
            browse,
        }
    }

    pub fn with_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.auth = auth.map(Arc::new);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::get_root))
        .route("/{*path}", get(handlers::get_path))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(req).await;
    };
    if auth.check(req.headers().get(header::AUTHORIZATION)) {
        next.run(req).await
    } else {
        debug!("rejecting unauthenticated request for {}", req.uri().path());
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, auth.challenge())],
            "unauthorized",
        )
            .into_response()
    }
}

/// Listen on `listen` until `cancel` fires, then stop accepting and let
/// in-flight requests finish.
pub async fn serve(state: AppState, listen: &str, cancel: CancellationToken) -> Result<()> {
    let start = Instant::now();
    let listener = TcpListener::bind(listen)
        .await
        .context(|| format!("binding {listen}"))?;
    let addr = listener.local_addr()?;
    tracing::info!("serve: listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context(|| format!("serving on {addr}"))?;

    tracing::info!(
        "serve: shut down addr={} elapsed={:.2}s",
        addr,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
