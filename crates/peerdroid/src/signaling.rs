//! WebSocket client for the signaling relay.
//!
//! One client serves one negotiation attempt. It joins the relay session
//! derived from the link secret, seals outbound SDP/ICE payloads with the
//! link key, and turns relay traffic into [`SignalingEvent`]s.

use crate::error::LinkError;
use crate::rtc::IceCandidate;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerdroid_common::crypto::EncryptionKey;
use peerdroid_common::signal::{
    open_payload, seal_payload, session_url, CandidatePayload, ClientSource, RelayMessage,
    RpcMessage, RpcMethod, SdpPayload,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRecv = SplitStream<WsStream>;

/// Relay traffic relevant to negotiation, with payloads already opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// The remote side is present in the session.
    RemoteConnected {
        /// Relay id of the remote side.
        remote_client_id: String,
    },
    /// The remote side left the session.
    RemoteDisconnected {
        /// Relay id of the remote side.
        remote_client_id: String,
    },
    /// SDP offer from the remote side.
    Offer {
        /// Sender.
        remote_client_id: String,
        /// Offer SDP.
        sdp: String,
    },
    /// Trickled candidate from the remote side.
    IceCandidate {
        /// Sender.
        remote_client_id: String,
        /// The candidate.
        candidate: IceCandidate,
    },
    /// The relay accepted one of our messages.
    Confirmed {
        /// Id of the confirmed message.
        request_id: String,
    },
    /// The relay could not deliver one of our messages.
    Undeliverable {
        /// Id of the undeliverable message.
        request_id: String,
    },
}

/// Maps one relay message to a negotiation event.
///
/// Returns `Ok(None)` for traffic that is logged and skipped: payloads that
/// do not open under `key`, and relay parse complaints.
///
/// # Errors
///
/// Returns [`LinkError::Signaling`] when the relay rejects our messages.
pub fn interpret(
    message: RelayMessage,
    key: &EncryptionKey,
) -> Result<Option<SignalingEvent>, LinkError> {
    let event = match message {
        RelayMessage::RemoteClientJustConnected { remote_client_id }
        | RelayMessage::RemoteClientIsAlreadyConnected { remote_client_id } => {
            SignalingEvent::RemoteConnected { remote_client_id }
        }
        RelayMessage::RemoteClientDisconnected { remote_client_id } => {
            SignalingEvent::RemoteDisconnected { remote_client_id }
        }
        RelayMessage::Confirmation { request_id } => SignalingEvent::Confirmed { request_id },
        RelayMessage::MissingRemoteClientError { request_id } => {
            SignalingEvent::Undeliverable { request_id }
        }
        RelayMessage::RemoteData {
            remote_client_id,
            data,
            ..
        } => match open_remote_data(remote_client_id, &data, key) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, method = ?data.method, "dropping unreadable signaling payload");
                return Ok(None);
            }
        },
        RelayMessage::InvalidMessageError { error } => {
            warn!(error = %error, "relay could not parse a message we sent");
            return Ok(None);
        }
        RelayMessage::ValidationError { error } => {
            return Err(LinkError::Signaling(format!(
                "relay rejected message: {error}"
            )));
        }
    };
    Ok(Some(event))
}

/// Opens a relayed RPC. The wallet only ever answers, so answers addressed
/// to it are dropped unopened.
fn open_remote_data(
    remote_client_id: String,
    data: &RpcMessage,
    key: &EncryptionKey,
) -> Result<Option<SignalingEvent>, peerdroid_common::signal::PayloadError> {
    Ok(Some(match data.method {
        RpcMethod::Offer => {
            let SdpPayload { sdp } = open_payload(&data.encrypted_payload, key)?;
            SignalingEvent::Offer {
                remote_client_id,
                sdp,
            }
        }
        RpcMethod::Answer => {
            debug!(%remote_client_id, "ignoring answer, the wallet never offers");
            return Ok(None);
        }
        RpcMethod::IceCandidate => {
            let candidate: CandidatePayload = open_payload(&data.encrypted_payload, key)?;
            SignalingEvent::IceCandidate {
                remote_client_id,
                candidate,
            }
        }
    }))
}

/// Connected signaling session for one negotiation attempt.
pub struct SignalingClient {
    connection_id: String,
    key: Arc<EncryptionKey>,
    ws_tx: WsSink,
    ws_rx: WsRecv,
}

impl SignalingClient {
    /// Joins the relay session `connection_id` as the wallet.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Signaling`] if the relay is unreachable or
    /// refuses the upgrade.
    pub async fn connect(
        relay: &str,
        connection_id: &str,
        key: Arc<EncryptionKey>,
    ) -> Result<Self, LinkError> {
        let url = session_url(relay, connection_id, ClientSource::Wallet);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| LinkError::Signaling(format!("relay unreachable: {e}")))?;
        let (ws_tx, ws_rx) = ws.split();
        debug!(connection_id, "joined signaling session");
        Ok(Self {
            connection_id: connection_id.to_owned(),
            key,
            ws_tx,
            ws_rx,
        })
    }

    /// Waits for the next negotiation event. Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Signaling`] when the relay closes, the socket
    /// fails, or the relay rejects one of our messages.
    pub async fn recv(&mut self) -> Result<SignalingEvent, LinkError> {
        loop {
            let msg = self
                .ws_rx
                .next()
                .await
                .ok_or_else(|| LinkError::Signaling("relay closed the connection".into()))?
                .map_err(|e| LinkError::Signaling(e.to_string()))?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(LinkError::Signaling("relay closed the connection".into()))
                }
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    continue
                }
            };
            let relay_msg: RelayMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable relay message");
                    continue;
                }
            };
            if let Some(event) = interpret(relay_msg, &self.key)? {
                return Ok(event);
            }
        }
    }

    /// Sends an SDP answer. Returns the request id.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Signaling`] if sealing or the socket write fails.
    pub async fn send_answer(&mut self, target: &str, sdp: &str) -> Result<String, LinkError> {
        let payload = SdpPayload { sdp: sdp.to_owned() };
        self.send_rpc(RpcMethod::Answer, target, &payload).await
    }

    /// Trickles a local candidate. Returns the request id.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Signaling`] if sealing or the socket write fails.
    pub async fn send_candidate(
        &mut self,
        target: &str,
        candidate: &IceCandidate,
    ) -> Result<String, LinkError> {
        self.send_rpc(RpcMethod::IceCandidate, target, candidate).await
    }

    async fn send_rpc<T: serde::Serialize + Sync>(
        &mut self,
        method: RpcMethod,
        target: &str,
        payload: &T,
    ) -> Result<String, LinkError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let encrypted_payload = seal_payload(payload, &self.key)
            .map_err(|e| LinkError::Signaling(format!("cannot seal payload: {e}")))?;
        let rpc = RpcMessage {
            method,
            source: ClientSource::Wallet,
            connection_id: self.connection_id.clone(),
            request_id: request_id.clone(),
            target_client_id: target.to_owned(),
            encrypted_payload,
        };
        let text = serde_json::to_string(&rpc)
            .map_err(|e| LinkError::Signaling(format!("cannot encode message: {e}")))?;
        self.ws_tx
            .send(Message::Text(text))
            .await
            .map_err(|e| LinkError::Signaling(e.to_string()))?;
        debug!(?method, request_id = %request_id, "sent signaling message");
        Ok(request_id)
    }

    /// Sends a keepalive ping.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Signaling`] if the socket write fails.
    pub async fn ping(&mut self) -> Result<(), LinkError> {
        self.ws_tx
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| LinkError::Signaling(e.to_string()))
    }

    /// Leaves the session.
    pub async fn close(mut self) {
        if let Err(e) = self.ws_tx.send(Message::Close(None)).await {
            debug!(error = %e, "signaling close frame not sent");
        }
        let _ = self.ws_tx.close().await;
    }
}
