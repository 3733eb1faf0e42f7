#![allow(dead_code)]

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use peerdroid::config::LinkConfig;
use peerdroid::keypair::WalletIdentity;
use peerdroid::link::{link_message, LinkHandshake};
use peerdroid::rtc::memory::MemoryNetwork;
use peerdroid::rtc::{DataChannel, RtcEvent, RtcPeer, SessionDescription};
use peerdroid::store::MemoryPeerStore;
use peerdroid::{LinkError, MessageEnvelope, PeerId, PeerState, Registry};
use peerdroid_common::chunk::{split, Package, Progress, Reassembler, DEFAULT_MAX_CHUNK_SIZE};
use peerdroid_common::crypto::{decrypt, derive_key, encrypt, ConnectionSecret, EncryptionKey};
use peerdroid_common::signal::{
    open_payload, seal_payload, session_url, CandidatePayload, ClientSource, RelayMessage,
    RpcMessage, RpcMethod, SdpPayload,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(10);

// ── Relay ───────────────────────────────────────────────────────────

struct RelayClient {
    id: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// In-process signaling relay with the session semantics the link expects.
pub struct TestRelay {
    pub addr: SocketAddr,
    clients: Arc<DashMap<String, RelayClient>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let clients: Arc<DashMap<String, RelayClient>> = Arc::new(DashMap::new());
        let shared = clients.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(stream, shared.clone()));
            }
        });
        Self { addr, clients }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of sockets currently joined to any session.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn slot(connection_id: &str, source: ClientSource) -> String {
    format!("{connection_id}/{}", source.as_str())
}

fn send_json(tx: &mpsc::UnboundedSender<Message>, msg: &RelayMessage) {
    let _ = tx.send(Message::Text(serde_json::to_string(msg).unwrap()));
}

async fn serve_client(stream: TcpStream, clients: Arc<DashMap<String, RelayClient>>) {
    let mut uri = None;
    let callback = |req: &Request, resp: Response| {
        uri = Some(req.uri().clone());
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let Some(uri) = uri else { return };
    let connection_id = uri.path().trim_start_matches('/').to_owned();
    let source = match uri.query().unwrap_or_default() {
        q if q.contains("source=wallet") => ClientSource::Wallet,
        q if q.contains("source=extension") => ClientSource::Extension,
        _ => return,
    };

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let id = uuid::Uuid::new_v4().to_string();
    let me = slot(&connection_id, source);
    let other = slot(&connection_id, source.counterpart());
    clients.insert(
        me.clone(),
        RelayClient {
            id: id.clone(),
            tx: tx.clone(),
        },
    );
    if let Some(peer) = clients.get(&other) {
        send_json(
            &tx,
            &RelayMessage::RemoteClientIsAlreadyConnected {
                remote_client_id: peer.id.clone(),
            },
        );
        send_json(
            &peer.tx,
            &RelayMessage::RemoteClientJustConnected {
                remote_client_id: id.clone(),
            },
        );
    }

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let rpc: RpcMessage = match serde_json::from_str(&text) {
            Ok(rpc) => rpc,
            Err(e) => {
                send_json(
                    &tx,
                    &RelayMessage::InvalidMessageError {
                        error: e.to_string(),
                    },
                );
                continue;
            }
        };
        let request_id = rpc.request_id.clone();
        match clients.get(&other) {
            Some(peer) => {
                send_json(
                    &peer.tx,
                    &RelayMessage::RemoteData {
                        remote_client_id: id.clone(),
                        request_id: request_id.clone(),
                        data: rpc,
                    },
                );
                send_json(&tx, &RelayMessage::Confirmation { request_id });
            }
            None => send_json(&tx, &RelayMessage::MissingRemoteClientError { request_id }),
        }
    }

    clients.remove_if(&me, |_, c| c.id == id);
    if let Some(peer) = clients.get(&other) {
        send_json(
            &peer.tx,
            &RelayMessage::RemoteClientDisconnected {
                remote_client_id: id.clone(),
            },
        );
    }
    drop(tx);
    let _ = writer.await;
}

// ── Registry setup ──────────────────────────────────────────────────

pub fn test_config(relay: &TestRelay) -> LinkConfig {
    let mut config = LinkConfig {
        relay: relay.url(),
        ..LinkConfig::default()
    };
    config.timeouts.link_secs = 5;
    config.timeouts.offer_secs = 4;
    config.timeouts.ice_secs = 2;
    config.timeouts.close_secs = 2;
    config.reconnect.initial_delay_ms = 50;
    config.reconnect.max_delay_ms = 200;
    config
}

pub fn test_registry(
    config: LinkConfig,
    network: &MemoryNetwork,
    store: Arc<MemoryPeerStore>,
) -> Registry {
    Registry::new(
        config,
        Arc::new(network.clone()),
        store,
        WalletIdentity::generate(),
    )
}

/// Polls until `peer` reports `want`.
pub async fn wait_for_state(registry: &Registry, peer: PeerId, want: PeerState) {
    let reached = tokio::time::timeout(WAIT, async {
        loop {
            if registry.state(peer).await == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "peer never reached {want}");
}

/// Waits until the watch reads `want`.
pub async fn wait_for_flag(flag: &mut tokio::sync::watch::Receiver<bool>, want: bool) {
    let reached = tokio::time::timeout(WAIT, flag.wait_for(|v| *v == want)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "any-connected never became {want}"
    );
}

// ── Simulated extension ─────────────────────────────────────────────

/// How the simulated extension behaves once the channel opens.
#[derive(Clone)]
pub struct ExtensionOptions {
    /// Key the extension proves in its handshake.
    pub identity: WalletIdentity,
    /// Send a link handshake first. `None` for already-linked sessions.
    pub handshake: Option<ConnectionSecret>,
    /// Answer every envelope with `{"echo": payload}` under the same id.
    pub echo: bool,
}

impl ExtensionOptions {
    pub fn linking(secret: &ConnectionSecret) -> Self {
        Self {
            identity: WalletIdentity::generate(),
            handshake: Some(secret.clone()),
            echo: true,
        }
    }

    pub fn reconnecting() -> Self {
        Self {
            identity: WalletIdentity::generate(),
            handshake: None,
            echo: true,
        }
    }
}

/// What the extension observed.
#[derive(Debug)]
pub enum ExtensionEvent {
    ChannelOpen,
    Received(MessageEnvelope),
    WalletHandshake(Result<(), LinkError>),
    ChannelClosed,
}

enum ExtensionCommand {
    Send(MessageEnvelope),
    SendCorrupted(MessageEnvelope),
    SendSealedWith(MessageEnvelope, ConnectionSecret),
    CloseChannel,
}

pub struct SimulatedExtension {
    pub events: mpsc::UnboundedReceiver<ExtensionEvent>,
    commands: mpsc::UnboundedSender<ExtensionCommand>,
    task: JoinHandle<()>,
}

impl SimulatedExtension {
    pub fn start(
        relay: &TestRelay,
        network: &MemoryNetwork,
        secret: &ConnectionSecret,
        options: ExtensionOptions,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_extension(
            relay.url(),
            network.clone(),
            secret.clone(),
            options,
            events_tx,
            commands_rx,
        ));
        Self {
            events,
            commands,
            task,
        }
    }

    pub fn send(&self, envelope: MessageEnvelope) {
        let _ = self.commands.send(ExtensionCommand::Send(envelope));
    }

    /// Sends `envelope` with one byte of its first chunk flipped in transit.
    pub fn send_corrupted(&self, envelope: MessageEnvelope) {
        let _ = self.commands.send(ExtensionCommand::SendCorrupted(envelope));
    }

    /// Sends `envelope` sealed under a key derived from `secret` instead of
    /// the link's.
    pub fn send_sealed_with(&self, envelope: MessageEnvelope, secret: &ConnectionSecret) {
        let _ = self
            .commands
            .send(ExtensionCommand::SendSealedWith(envelope, secret.clone()));
    }

    pub fn close_channel(&self) {
        let _ = self.commands.send(ExtensionCommand::CloseChannel);
    }

    pub async fn next_event(&mut self) -> ExtensionEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for extension event")
            .expect("extension stopped")
    }

    /// Waits for the next envelope the extension received.
    pub async fn next_received(&mut self) -> MessageEnvelope {
        loop {
            if let ExtensionEvent::Received(envelope) = self.next_event().await {
                return envelope;
            }
        }
    }

    /// Result of verifying the wallet's link handshake.
    pub async fn wallet_handshake(&mut self) -> Result<(), LinkError> {
        loop {
            if let ExtensionEvent::WalletHandshake(result) = self.next_event().await {
                return result;
            }
        }
    }

    pub async fn wait_closed(&mut self) {
        loop {
            if let ExtensionEvent::ChannelClosed = self.next_event().await {
                return;
            }
        }
    }
}

impl Drop for SimulatedExtension {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_envelope(channel: &dyn DataChannel, key: &EncryptionKey, envelope: &MessageEnvelope) {
    send_packages(channel, key, envelope, false).await;
}

async fn send_packages(
    channel: &dyn DataChannel,
    key: &EncryptionKey,
    envelope: &MessageEnvelope,
    corrupt: bool,
) {
    let sealed = encrypt(&serde_json::to_vec(envelope).unwrap(), key).unwrap();
    let mut set = split(&sealed, DEFAULT_MAX_CHUNK_SIZE).unwrap();
    if corrupt {
        set.chunks[0].chunk_data[0] ^= 0x01;
    }
    for package in set.packages() {
        channel.send(package.encode().unwrap()).await.unwrap();
    }
}

async fn send_rpc<S>(
    ws_tx: &mut S,
    key: &EncryptionKey,
    connection_id: &str,
    target: &str,
    method: RpcMethod,
    payload: &impl serde::Serialize,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let rpc = RpcMessage {
        method,
        source: ClientSource::Extension,
        connection_id: connection_id.to_owned(),
        request_id: uuid::Uuid::new_v4().to_string(),
        target_client_id: target.to_owned(),
        encrypted_payload: seal_payload(payload, key).unwrap(),
    };
    ws_tx
        .send(Message::Text(serde_json::to_string(&rpc).unwrap()))
        .await
        .unwrap();
}

/// The extension offers, trickles candidates, performs the handshake and
/// then echoes. It never re-offers; tests start a new one to re-link.
async fn run_extension(
    relay: String,
    network: MemoryNetwork,
    secret: ConnectionSecret,
    options: ExtensionOptions,
    events: mpsc::UnboundedSender<ExtensionEvent>,
    mut commands: mpsc::UnboundedReceiver<ExtensionCommand>,
) {
    let key = derive_key(&secret);
    let connection_id = secret.connection_id();
    let url = session_url(&relay, &connection_id, ClientSource::Extension);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (rtc, mut rtc_events) = network.peer();
    let offer = rtc.create_offer().await.unwrap();
    rtc.set_local_description(offer.clone()).await.unwrap();

    let mut wallet: Option<String> = None;
    let mut local_candidates: Vec<CandidatePayload> = Vec::new();
    let mut channel: Option<Arc<dyn DataChannel>> = None;
    let mut reassembler = Reassembler::default();
    let mut awaiting_wallet_handshake = options.handshake.is_some();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(_) => continue,
                    None => return,
                };
                let Ok(relay_msg) = serde_json::from_str::<RelayMessage>(&text) else { continue };
                match relay_msg {
                    RelayMessage::RemoteClientJustConnected { remote_client_id }
                    | RelayMessage::RemoteClientIsAlreadyConnected { remote_client_id } => {
                        if wallet.is_none() {
                            send_rpc(&mut ws_tx, &key, &connection_id, &remote_client_id,
                                RpcMethod::Offer, &SdpPayload { sdp: offer.sdp.clone() }).await;
                            for candidate in local_candidates.drain(..) {
                                send_rpc(&mut ws_tx, &key, &connection_id, &remote_client_id,
                                    RpcMethod::IceCandidate, &candidate).await;
                            }
                            wallet = Some(remote_client_id);
                        }
                    }
                    RelayMessage::RemoteData { data, .. } => match data.method {
                        RpcMethod::Answer => {
                            let SdpPayload { sdp } = open_payload(&data.encrypted_payload, &key).unwrap();
                            rtc.set_remote_description(SessionDescription::answer(sdp)).await.unwrap();
                        }
                        RpcMethod::IceCandidate => {
                            let candidate: CandidatePayload =
                                open_payload(&data.encrypted_payload, &key).unwrap();
                            rtc.add_ice_candidate(candidate).await.unwrap();
                        }
                        RpcMethod::Offer => {}
                    },
                    _ => {}
                }
            }
            event = rtc_events.recv() => {
                let Some(event) = event else { return };
                match event {
                    RtcEvent::IceCandidate(candidate) => match wallet.as_deref() {
                        Some(target) => send_rpc(&mut ws_tx, &key, &connection_id, target,
                            RpcMethod::IceCandidate, &candidate).await,
                        None => local_candidates.push(candidate),
                    },
                    RtcEvent::DataChannelOpen(open) => {
                        let _ = events.send(ExtensionEvent::ChannelOpen);
                        if let Some(link_secret) = &options.handshake {
                            let handshake = LinkHandshake::sign(&options.identity, link_secret);
                            send_envelope(open.as_ref(), &key, &handshake.to_envelope().unwrap()).await;
                        }
                        channel = Some(open);
                    }
                    RtcEvent::Message(frame) => {
                        let package = Package::decode(&frame).unwrap();
                        let Progress::Complete { bytes, .. } =
                            reassembler.accept(package, Instant::now()).unwrap()
                        else {
                            continue;
                        };
                        let envelope: MessageEnvelope =
                            serde_json::from_slice(&decrypt(&bytes, &key).unwrap()).unwrap();
                        if awaiting_wallet_handshake {
                            awaiting_wallet_handshake = false;
                            let verified = LinkHandshake::from_envelope(&envelope)
                                .and_then(|h| h.verify(&secret, None))
                                .map(|_| ());
                            let _ = events.send(ExtensionEvent::WalletHandshake(verified));
                            continue;
                        }
                        let _ = events.send(ExtensionEvent::Received(envelope.clone()));
                        if options.echo {
                            if let Some(open) = &channel {
                                let reply = MessageEnvelope::with_id(
                                    envelope.id,
                                    serde_json::json!({ "echo": envelope.payload }),
                                );
                                send_envelope(open.as_ref(), &key, &reply).await;
                            }
                        }
                    }
                    RtcEvent::DataChannelClosed | RtcEvent::ConnectionFailed(_) => {
                        let _ = events.send(ExtensionEvent::ChannelClosed);
                        rtc.close().await;
                        return;
                    }
                    RtcEvent::IceGatheringChanged(_) => {}
                }
            }
            cmd = commands.recv() => match cmd {
                Some(ExtensionCommand::Send(envelope)) => {
                    if let Some(open) = &channel {
                        send_envelope(open.as_ref(), &key, &envelope).await;
                    }
                }
                Some(ExtensionCommand::SendCorrupted(envelope)) => {
                    if let Some(open) = &channel {
                        send_packages(open.as_ref(), &key, &envelope, true).await;
                    }
                }
                Some(ExtensionCommand::SendSealedWith(envelope, other)) => {
                    if let Some(open) = &channel {
                        send_envelope(open.as_ref(), &derive_key(&other), &envelope).await;
                    }
                }
                Some(ExtensionCommand::CloseChannel) => {
                    if let Some(open) = channel.take() {
                        open.close().await;
                    }
                }
                None => return,
            },
        }
    }
}

/// Link payload JSON for `secret`, signed by `identity`.
pub fn link_payload_json(identity: &WalletIdentity, secret: &ConnectionSecret) -> String {
    serde_json::json!({
        "password": secret.expose(),
        "publicKey": identity.public_key_hex(),
        "purpose": "general",
        "signature": hex::encode(identity.sign(&link_message(secret)).to_bytes()),
    })
    .to_string()
}
