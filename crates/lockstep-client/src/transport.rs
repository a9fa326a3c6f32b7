//! WebSocket transport.
//!
//! The server authenticates the upgrade request with a `token` query
//! parameter, so connecting is: append the token to the endpoint URL, perform
//! the handshake, wrap the stream in a [`Connection`].

use crate::connection::{Connection, DEFAULT_REQUEST_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tracing::info;

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connecting to '{url}' failed: {source}")]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
}

/// Connect to `url` (`ws://` or `wss://`), authenticating with `token`, and
/// wrap the channel in a [`Connection`] with the default request deadline.
pub async fn connect(url: &str, token: &str) -> Result<Arc<Connection>, ConnectError> {
    connect_with_timeout(url, token, DEFAULT_REQUEST_TIMEOUT).await
}

/// [`connect`] with an explicit per-request deadline.
pub async fn connect_with_timeout(
    url: &str,
    token: &str,
    request_timeout: Duration,
) -> Result<Arc<Connection>, ConnectError> {
    let request_url = url_with_token(url, token);
    let (ws, _response) = tokio_tungstenite::connect_async(&request_url)
        .await
        .map_err(|e| ConnectError::ConnectionFailed {
            url: url.to_owned(),
            source: Box::new(e),
        })?;
    info!(url, "connected");
    Ok(Connection::new(ws, request_timeout))
}

/// Append the auth token as a query parameter, respecting an existing query.
fn url_with_token(url: &str, token: &str) -> String {
    let url = ensure_explicit_path(url);
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}token={token}")
}

/// Insert an explicit `/` path before the query string if the URL has none.
///
/// `http`'s `PathAndQuery::as_str()` drops the leading `/` when the path is
/// empty but a query is present (e.g. `ws://host:port?x=1`), which makes
/// tungstenite write a malformed request line. Guaranteeing an explicit path
/// sidesteps that.
fn ensure_explicit_path(url: &str) -> std::borrow::Cow<'_, str> {
    let authority_start = url.find("://").map_or(0, |idx| idx + 3);
    let rest = &url[authority_start..];
    match rest.find(['/', '?']) {
        Some(idx) if rest.as_bytes()[idx] == b'/' => std::borrow::Cow::Borrowed(url),
        Some(idx) => {
            let mut owned = url.to_owned();
            owned.insert(authority_start + idx, '/');
            std::borrow::Cow::Owned(owned)
        }
        None => std::borrow::Cow::Owned(format!("{url}/")),
    }
}
