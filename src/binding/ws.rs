//! WebSocket sync transport.
//!
//! Frames are JSON objects tagged by `type`. Each store syncs on its own
//! socket at `<sync_url>/<store_id>`; deletion goes over plain HTTP.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::binding::remote::{SyncChannel, SyncTransport};
use crate::config::RemoteConfig;
use crate::core::store::{ChangeKind, StoreId, StoreSnapshot};
use crate::error::TransportError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Frame {
    Pull,
    Snapshot { snapshot: StoreSnapshot },
    Push { snapshot: StoreSnapshot },
    Change { change: ChangeKind },
    Ack,
}

pub struct WsSyncTransport {
    sync_url: String,
    api_base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl WsSyncTransport {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let timeout = config.request_timeout();
        Ok(Self {
            sync_url: config.sync_url.trim_end_matches('/').to_string(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            timeout,
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl SyncTransport for WsSyncTransport {
    async fn connect(&self, store_id: &StoreId) -> Result<Box<dyn SyncChannel>, TransportError> {
        let url = format!("{}/{}", self.sync_url, store_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _response) = timeout(self.timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        debug!(store_id = %store_id, "sync socket open");
        Ok(Box::new(WsChannel {
            stream,
            pending: VecDeque::new(),
            timeout: self.timeout,
        }))
    }

    async fn delete_remote(&self, store_id: &StoreId) -> Result<(), TransportError> {
        let url = format!("{}/stores/{}", self.api_base_url, store_id);
        let mut request = self.http.delete(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;
        let status = response.status();
        // Already gone counts as deleted.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Changes that arrived while waiting for a snapshot.
    pending: VecDeque<ChangeKind>,
    timeout: Duration,
}

impl WsChannel {
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        timeout(self.timeout, self.stream.send(Message::Text(text)))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        Ok(())
    }

    /// Next data frame, or `None` once the socket is closed.
    async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Binary(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
                Message::Close(_) => return Ok(None),
                // Pings are answered by tungstenite itself.
                _ => continue,
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SyncChannel for WsChannel {
    async fn pull(&mut self) -> Result<StoreSnapshot, TransportError> {
        self.send_frame(&Frame::Pull).await?;
        loop {
            let frame = timeout(self.timeout, self.read_frame())
                .await
                .map_err(|_| TransportError::Timeout(self.timeout))??;
            match frame {
                Some(Frame::Snapshot { snapshot }) => return Ok(snapshot),
                Some(Frame::Change { change }) => self.pending.push_back(change),
                Some(_) => continue,
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn push(&mut self, snapshot: &StoreSnapshot) -> Result<(), TransportError> {
        self.send_frame(&Frame::Push {
            snapshot: snapshot.clone(),
        })
        .await
    }

    async fn send_change(&mut self, change: &ChangeKind) -> Result<(), TransportError> {
        self.send_frame(&Frame::Change {
            change: change.clone(),
        })
        .await
    }

    async fn next_change(&mut self) -> Result<Option<ChangeKind>, TransportError> {
        if let Some(change) = self.pending.pop_front() {
            return Ok(Some(change));
        }
        loop {
            match self.read_frame().await? {
                Some(Frame::Change { change }) => return Ok(Some(change)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
