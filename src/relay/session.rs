//!
//! WebSocket session against a single Nostr relay.
//!
//! This module provides the transport layer for the audit engine: one
//! connection, REQ/CLOSE subscription management, and sequential delivery of
//! inbound frames. The session deserializes frame envelopes only; it never
//! interprets event content. There is no reconnection policy here - a
//! connection failure surfaces to the caller, which owns any retry decision.

use super::types::{Filter, Frame, RelayError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Transport capability the audit engine drives.
///
/// `RelaySession` is the live implementation; tests substitute scripted
/// sources so the pagination loop runs without a network.
#[async_trait::async_trait]
pub trait RelayTransport: Send {
	/// Open a subscription for `filter` and return its id.
	async fn subscribe(&mut self, filter: &Filter) -> Result<String, RelayError>;

	/// Close a previously opened subscription.
	async fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), RelayError>;

	/// Wait for the next inbound frame. `None` means the relay closed the
	/// connection.
	async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError>;

	/// Close the connection.
	async fn close(&mut self) -> Result<(), RelayError>;
}

/// A live WebSocket session with a Nostr relay.
pub struct RelaySession {
	sender: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
	receiver: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
	url: String,
}

impl RelaySession {
	/// Connect to the relay at `url` (ws:// or wss://).
	pub async fn open(url: &str) -> Result<Self, RelayError> {
		debug!("Connecting to relay: {}", url);
		let (ws_stream, response) = connect_async(url).await.map_err(RelayError::Connect)?;
		debug!(
			"Relay connection established, response status: {}",
			response.status()
		);
		let (sender, receiver) = ws_stream.split();
		Ok(Self {
			sender,
			receiver,
			url: url.to_string(),
		})
	}

	fn random_subscription_id() -> String {
		let mut bytes = [0u8; 8];
		rand::rng().fill(&mut bytes);
		hex::encode(bytes)
	}
}

#[async_trait::async_trait]
impl RelayTransport for RelaySession {
	async fn subscribe(&mut self, filter: &Filter) -> Result<String, RelayError> {
		let subscription_id = Self::random_subscription_id();
		let request = json!(["REQ", subscription_id, filter]);
		debug!("Sending request to {}: {}", self.url, request);
		self.sender
			.send(Message::Text(request.to_string()))
			.await
			.map_err(RelayError::Transport)?;
		Ok(subscription_id)
	}

	async fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), RelayError> {
		let request = json!(["CLOSE", subscription_id]);
		self.sender
			.send(Message::Text(request.to_string()))
			.await
			.map_err(RelayError::Transport)?;
		Ok(())
	}

	async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError> {
		loop {
			match self.receiver.next().await {
				Some(Ok(Message::Text(text))) => {
					let frame = Frame::parse(&text);
					if matches!(frame, Frame::Malformed) {
						warn!("Malformed frame from relay: {}", text);
					}
					return Ok(Some(frame));
				}
				// Control and binary messages carry nothing for the audit.
				Some(Ok(Message::Ping(_)))
				| Some(Ok(Message::Pong(_)))
				| Some(Ok(Message::Binary(_)))
				| Some(Ok(Message::Frame(_))) => continue,
				Some(Ok(Message::Close(_))) | None => return Ok(None),
				Some(Err(e)) => return Err(RelayError::Transport(e)),
			}
		}
	}

	async fn close(&mut self) -> Result<(), RelayError> {
		debug!("Closing relay session: {}", self.url);
		self.sender
			.send(Message::Close(None))
			.await
			.map_err(RelayError::Transport)?;
		Ok(())
	}
}
