//! Outbound HTTP: the engine queues `Outbound` requests, the dispatcher runs
//! them on the runtime and hands each reply back as a `Completion` message.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::plugs::PlugId;

/// A request produced by the engine. Carries enough context for the reply to
/// be routed back without touching the request itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// `GET {provider}/set?...` for one plug.
    Control {
        plug: PlugId,
        provider: String,
        url: String,
    },
    /// `GET {provider}/status[?known=N]`.
    Status { provider: String, url: String },
}

impl Outbound {
    pub fn url(&self) -> &str {
        match self {
            Self::Control { url, .. } | Self::Status { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

/// `Err` carries a transport failure description (connect refused, timeout).
#[derive(Debug)]
pub enum Completion {
    Control {
        plug: PlugId,
        provider: String,
        reply: Result<Reply, String>,
    },
    Status {
        provider: String,
        reply: Result<Reply, String>,
    },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Dispatcher {
    /// Redirects are followed by the client, so the engine only ever sees
    /// the final reply.
    pub fn new(timeout: Duration) -> Result<(Self, mpsc::UnboundedReceiver<Completion>)> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("failed to build http client")?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                client,
                completions: tx,
            },
            rx,
        ))
    }

    /// Fire and forget: each request runs in its own task.
    pub fn dispatch(&self, batch: Vec<Outbound>) {
        for outbound in batch {
            debug!(url = %outbound.url(), "dispatching");
            let client = self.client.clone();
            let tx = self.completions.clone();
            tokio::spawn(async move {
                let completion = match outbound {
                    Outbound::Control {
                        plug,
                        provider,
                        url,
                    } => Completion::Control {
                        plug,
                        provider,
                        reply: fetch(&client, &url).await,
                    },
                    Outbound::Status { provider, url } => Completion::Status {
                        provider,
                        reply: fetch(&client, &url).await,
                    },
                };
                // The receiver only goes away at shutdown.
                let _ = tx.send(completion);
            });
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Reply, String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("cannot reach {url}: {e}"))?;
    let status = resp.status().as_u16();
    let body = resp
        .text()
        .await
        .map_err(|e| format!("bad reply from {url}: {e}"))?;
    Ok(Reply { status, body })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn spawn_provider() -> String {
        let app = Router::new()
            .route("/relay/status", get(|| async { r#"{"latest":3}"# }))
            .route(
                "/old/status",
                get(|| async { axum::response::Redirect::temporary("/relay/status") }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn status_reply_is_routed_back() {
        let base = spawn_provider().await;
        let (dispatcher, mut rx) = Dispatcher::new(Duration::from_secs(5)).unwrap();
        let provider = format!("{base}/relay");
        dispatcher.dispatch(vec![Outbound::Status {
            provider: provider.clone(),
            url: format!("{provider}/status"),
        }]);

        match rx.recv().await.unwrap() {
            Completion::Status { provider: p, reply } => {
                assert_eq!(p, provider);
                let reply = reply.unwrap();
                assert_eq!(reply.status, 200);
                assert!(reply.body.contains("latest"));
            }
            other => panic!("unexpected completion {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let base = spawn_provider().await;
        let (dispatcher, mut rx) = Dispatcher::new(Duration::from_secs(5)).unwrap();
        dispatcher.dispatch(vec![Outbound::Status {
            provider: format!("{base}/old"),
            url: format!("{base}/old/status"),
        }]);

        match rx.recv().await.unwrap() {
            Completion::Status { reply, .. } => assert_eq!(reply.unwrap().status, 200),
            other => panic!("unexpected completion {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (dispatcher, mut rx) = Dispatcher::new(Duration::from_secs(5)).unwrap();
        dispatcher.dispatch(vec![Outbound::Status {
            provider: format!("http://{addr}"),
            url: format!("http://{addr}/status"),
        }]);

        match rx.recv().await.unwrap() {
            Completion::Status { reply, .. } => assert!(reply.is_err()),
            other => panic!("unexpected completion {other:?}"),
        }
    }
}
