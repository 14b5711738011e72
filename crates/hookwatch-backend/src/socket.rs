//! WebSocket client plumbing shared by both backends.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{BackendError, Result};

/// `url` without credentials, query or fragment, for logging.
#[must_use]
pub fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    let _ = url.set_password(None);
    let _ = url.set_username("");
    url.to_string()
}

/// An open socket with its pump tasks.
///
/// Dropping the connection closes it without invoking the close callback.
pub struct SocketConnection {
    outbound: mpsc::UnboundedSender<Message>,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl SocketConnection {
    /// Connect to `url` and start pumping frames.
    ///
    /// `on_text` receives every text (or UTF-8 binary) frame. `on_closed`
    /// fires once if the peer closes or the transport fails, with the reason
    /// when one is known.
    ///
    /// # Errors
    /// Returns `Timeout` if the handshake exceeds `timeout`, otherwise
    /// `Connection` on handshake failure.
    pub async fn open<T, C>(url: &Url, timeout: Duration, on_text: T, on_closed: C) -> Result<Self>
    where
        T: Fn(&str) + Send + 'static,
        C: FnOnce(Option<String>) + Send + 'static,
    {
        let (stream, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(BackendError::connection)?;
        tracing::debug!(url = %redacted(url), "socket connected");

        let (mut sink, mut source) = stream.split();

        // Channel for sending messages to the server
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();

        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("socket send failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let recv_task = tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => on_text(text.as_str()),
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => on_text(text),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.as_str().to_string()).filter(|r| !r.is_empty());
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("socket error: {e}");
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            on_closed(reason);
        });

        Ok(Self {
            outbound,
            recv_task,
            send_task,
        })
    }

    /// Queue a text frame.
    ///
    /// # Errors
    /// Returns a connection error if the socket has already closed.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.outbound
            .send(Message::text(text))
            .map_err(|_| BackendError::Connection("socket is closed".to_string()))
    }

    /// Queue a JSON frame.
    ///
    /// # Errors
    /// Returns a connection error if encoding fails or the socket is closed.
    pub fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message).map_err(BackendError::connection)?;
        self.send_text(json)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.recv_task.is_finished() && !self.send_task.is_finished()
    }

    /// Close the socket. Idempotent; the close callback is not invoked.
    pub fn close(&self) {
        self.recv_task.abort();
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}
