//! The connection registry: the public surface of the peer link.
//!
//! The peer map is the only state shared across tasks and is only touched
//! under one async mutex. Each peer runs as an independent supervisor task
//! that reports back through watches and the shared broadcast streams.

use crate::channel::DataChannelWrapper;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::keypair::WalletIdentity;
use crate::link::{LinkHandshake, LinkPayload};
use crate::orchestrator::{supervise_peer, Control, PeerCommand, PeerContext, PeerState};
use crate::rtc::PeerConnector;
use crate::store::{LinkPurpose, PeerRecord, PeerStore};
use crate::types::{ConnectionEvent, InboundMessage, MessageEnvelope, PeerId};
use ed25519_dalek::VerifyingKey;
use futures_util::future::join_all;
use peerdroid_common::crypto::{derive_key_with, ConnectionSecret, KdfVersion};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 1024;
const COMMAND_QUEUE: usize = 8;

/// A registered peer as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    /// Registry id.
    pub id: PeerId,
    /// Name given at link time.
    pub display_name: String,
    /// Relay session id of the link.
    pub connection_id: String,
    /// Current state.
    pub state: PeerState,
}

/// Owned resources of one registered peer. Dropping it stops the peer.
struct PeerHandle {
    display_name: String,
    connection_id: String,
    /// Set once the link handshake passed or the peer was restored.
    confirmed: bool,
    commands: mpsc::Sender<PeerCommand>,
    state: watch::Receiver<PeerState>,
    channel: watch::Receiver<Option<DataChannelWrapper>>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    fn wrapper(&self) -> Option<DataChannelWrapper> {
        if *self.state.borrow() != PeerState::Connected {
            return None;
        }
        self.channel.borrow().clone()
    }

    /// Asks the supervisor to stop, waits up to `wait`, then aborts it.
    async fn shutdown(mut self, peer: PeerId, wait: Duration) {
        let _ = self.commands.send(PeerCommand::Close).await;
        if tokio::time::timeout(wait, &mut self.task).await.is_err() {
            warn!(peer = %peer, "peer did not stop in time, aborting");
            self.task.abort();
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RegistryInner {
    config: Arc<LinkConfig>,
    connector: Arc<dyn PeerConnector>,
    store: Arc<dyn PeerStore>,
    identity: WalletIdentity,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    any_connected: watch::Receiver<bool>,
}

/// Links, routes to and unlinks peers.
///
/// Cheap to clone; clones share the same peers. Must be created inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn PeerStore>,
        identity: WalletIdentity,
    ) -> Self {
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (any_connected_tx, any_connected) = watch::channel(false);
        let events_rx = events_tx.subscribe();
        let inner = Arc::new(RegistryInner {
            config: Arc::new(config),
            connector,
            store,
            identity,
            peers: Mutex::new(HashMap::new()),
            inbound_tx,
            events_tx,
            any_connected,
        });
        tokio::spawn(track_any_connected(
            Arc::downgrade(&inner),
            events_rx,
            any_connected_tx,
        ));
        Self { inner }
    }

    /// Links a new peer from a shared secret.
    ///
    /// Resolves once the data channel is open and the remote handshake
    /// verified. The peer is persisted and re-linked after disconnects from
    /// then on.
    ///
    /// # Errors
    ///
    /// [`LinkError::LinkTimeout`] if the link is not up within
    /// `timeouts.link_secs`, [`LinkError::LinkRejected`] for a bad
    /// handshake, and negotiation or signaling errors from the attempt.
    pub async fn link_peer(
        &self,
        secret: ConnectionSecret,
        display_name: &str,
    ) -> Result<PeerId, LinkError> {
        self.link(secret, display_name, None, LinkPurpose::General)
            .await
    }

    /// Links a peer from a scanned payload, pinning the key it advertised.
    ///
    /// # Errors
    ///
    /// As [`link_peer`](Self::link_peer).
    pub async fn link_with_payload(
        &self,
        payload: &LinkPayload,
        display_name: &str,
    ) -> Result<PeerId, LinkError> {
        self.link(
            payload.secret.clone(),
            display_name,
            Some(payload.remote_public_key),
            payload.purpose,
        )
        .await
    }

    async fn link(
        &self,
        secret: ConnectionSecret,
        display_name: &str,
        expected_key: Option<VerifyingKey>,
        purpose: LinkPurpose,
    ) -> Result<PeerId, LinkError> {
        let peer = PeerId::new();
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (first_tx, first_rx) = oneshot::channel();
        let control = Control {
            commands,
            ready: Some(ready_tx),
            first_message: Some(first_tx),
            reconnect: false,
        };
        info!(peer = %peer, name = display_name, connection_id = %secret.connection_id(), "linking peer");
        self.spawn_peer(
            peer,
            &secret,
            KdfVersion::V1,
            display_name,
            false,
            commands_tx,
            control,
        )
        .await;

        let handshake = self.handshake(peer, &secret, expected_key.as_ref(), ready_rx, first_rx);
        let remote_key = match tokio::time::timeout(self.inner.config.timeouts.link(), handshake)
            .await
        {
            Ok(Ok(key)) => key,
            Ok(Err(e)) => return Err(self.abandon(peer, e).await),
            Err(_) => return Err(self.abandon(peer, LinkError::LinkTimeout).await),
        };

        let record = PeerRecord {
            id: peer,
            display_name: display_name.to_owned(),
            connection_secret: secret.expose().to_owned(),
            kdf: KdfVersion::V1,
            public_key: Some(hex::encode(remote_key.as_bytes())),
            purpose,
        };
        if let Err(e) = self.inner.store.save(record) {
            return Err(self.abandon(peer, e.into()).await);
        }

        let commands = {
            let mut peers = self.inner.peers.lock().await;
            let handle = peers
                .get_mut(&peer)
                .ok_or(LinkError::PeerNotConnected(peer))?;
            handle.confirmed = true;
            handle.commands.clone()
        };
        let _ = commands.send(PeerCommand::EnableReconnect).await;
        info!(peer = %peer, name = display_name, "peer linked");
        Ok(peer)
    }

    /// Waits for the channel, exchanges handshakes and returns the verified
    /// remote key.
    async fn handshake(
        &self,
        peer: PeerId,
        secret: &ConnectionSecret,
        expected_key: Option<&VerifyingKey>,
        ready: oneshot::Receiver<Result<(), LinkError>>,
        first_message: oneshot::Receiver<MessageEnvelope>,
    ) -> Result<VerifyingKey, LinkError> {
        ready.await.map_err(|_| LinkError::Cancelled)??;

        let (wrapper, state) = {
            let peers = self.inner.peers.lock().await;
            let handle = peers.get(&peer).ok_or(LinkError::Cancelled)?;
            let wrapper = handle.wrapper().ok_or(LinkError::PeerNotConnected(peer))?;
            (wrapper, handle.state.clone())
        };
        let ours = LinkHandshake::sign(&self.inner.identity, secret).to_envelope()?;
        wrapper.send(&ours).await?;

        let theirs = tokio::select! {
            first = first_message => first.map_err(|_| LinkError::Cancelled)?,
            () = left_connected(state) => return Err(LinkError::PeerNotConnected(peer)),
        };
        let key = LinkHandshake::from_envelope(&theirs)?.verify(secret, expected_key)?;
        debug!(peer = %peer, "link handshake verified");
        Ok(key)
    }

    async fn abandon(&self, peer: PeerId, error: LinkError) -> LinkError {
        warn!(peer = %peer, error = %error, "link failed");
        if self.remove_peer(peer).await {
            let _ = self.inner.events_tx.send(ConnectionEvent::Unlinked { peer });
        }
        error
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_peer(
        &self,
        peer: PeerId,
        secret: &ConnectionSecret,
        kdf: KdfVersion,
        display_name: &str,
        confirmed: bool,
        commands: mpsc::Sender<PeerCommand>,
        control: Control,
    ) {
        let inner = &self.inner;
        let (state_tx, state) = watch::channel(PeerState::Idle);
        let (channel_tx, channel) = watch::channel(None);
        let connection_id = secret.connection_id();
        let ctx = PeerContext {
            peer,
            key: Arc::new(derive_key_with(kdf, secret)),
            connection_id: connection_id.clone(),
            config: inner.config.clone(),
            connector: inner.connector.clone(),
            events: inner.events_tx.clone(),
            inbound: inner.inbound_tx.clone(),
            state_tx,
            channel_tx,
        };

        let mut peers = inner.peers.lock().await;
        let task = tokio::spawn(supervise_peer(ctx, control));
        peers.insert(
            peer,
            PeerHandle {
                display_name: display_name.to_owned(),
                connection_id,
                confirmed,
                commands,
                state,
                channel,
                task,
            },
        );
    }

    /// Removes and stops a peer. Returns whether it was registered.
    async fn remove_peer(&self, peer: PeerId) -> bool {
        let handle = self.inner.peers.lock().await.remove(&peer);
        let Some(handle) = handle else {
            return false;
        };
        handle
            .shutdown(peer, self.inner.config.timeouts.close())
            .await;
        true
    }

    /// Tears a peer down and forgets it. Unknown ids are a no-op.
    ///
    /// When this returns the peer's tasks have stopped and its key and
    /// buffers are released.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Store`] if the stored record cannot be deleted.
    pub async fn unlink_peer(&self, peer: PeerId) -> Result<(), LinkError> {
        let removed = self.remove_peer(peer).await;
        self.inner.store.delete(&peer)?;
        if removed {
            info!(peer = %peer, "peer unlinked");
            let _ = self.inner.events_tx.send(ConnectionEvent::Unlinked { peer });
        }
        Ok(())
    }

    async fn connected_wrapper(&self, peer: PeerId) -> Result<DataChannelWrapper, LinkError> {
        let peers = self.inner.peers.lock().await;
        peers
            .get(&peer)
            .filter(|h| h.confirmed)
            .and_then(PeerHandle::wrapper)
            .ok_or(LinkError::PeerNotConnected(peer))
    }

    /// Sends one envelope to a connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::PeerNotConnected`] if the peer is unknown or not
    /// `Connected`, or stops being connected mid-send.
    pub async fn send_to(&self, peer: PeerId, envelope: &MessageEnvelope) -> Result<(), LinkError> {
        let wrapper = self.connected_wrapper(peer).await?;
        wrapper.send(envelope).await
    }

    /// Sends one envelope to every connected peer. Returns how many accepted
    /// it.
    ///
    /// # Errors
    ///
    /// Never fails as a whole; per-peer failures are logged.
    pub async fn broadcast(&self, envelope: &MessageEnvelope) -> Result<usize, LinkError> {
        let wrappers: Vec<DataChannelWrapper> = {
            let peers = self.inner.peers.lock().await;
            peers
                .values()
                .filter(|h| h.confirmed)
                .filter_map(PeerHandle::wrapper)
                .collect()
        };
        let results = join_all(wrappers.iter().map(|w| w.send(envelope))).await;
        let mut delivered = 0;
        for (wrapper, result) in wrappers.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %wrapper.peer(), error = %e, "broadcast send failed"),
            }
        }
        Ok(delivered)
    }

    /// Merged stream of envelopes from every registered peer.
    #[must_use]
    pub fn inbound_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.inbound_tx.subscribe()
    }

    /// State changes, diagnostics and unlinks for every peer.
    #[must_use]
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// `true` while at least one peer is `Connected`.
    #[must_use]
    pub fn any_connected(&self) -> watch::Receiver<bool> {
        self.inner.any_connected.clone()
    }

    /// Current state of one peer.
    pub async fn state(&self, peer: PeerId) -> Option<PeerState> {
        let peers = self.inner.peers.lock().await;
        peers.get(&peer).map(|h| *h.state.borrow())
    }

    /// All registered peers, sorted by name.
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let peers = self.inner.peers.lock().await;
        let mut out: Vec<PeerSummary> = peers
            .iter()
            .map(|(id, h)| PeerSummary {
                id: *id,
                display_name: h.display_name.clone(),
                connection_id: h.connection_id.clone(),
                state: *h.state.borrow(),
            })
            .collect();
        out.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        out
    }

    /// Starts a supervised connection for every stored peer not already
    /// registered. Returns how many were started.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Store`] if the records cannot be loaded.
    pub async fn restore(&self) -> Result<usize, LinkError> {
        let records = self.inner.store.load()?;
        let mut started = 0;
        for record in records {
            if self.inner.peers.lock().await.contains_key(&record.id) {
                continue;
            }
            let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
            self.spawn_peer(
                record.id,
                &record.secret(),
                record.kdf,
                &record.display_name,
                true,
                commands_tx,
                Control::restored(commands),
            )
            .await;
            debug!(peer = %record.id, name = %record.display_name, "restored peer");
            started += 1;
        }
        info!(count = started, "restored peers");
        Ok(started)
    }

    /// Stops every peer but keeps their stored records.
    pub async fn shutdown(&self) {
        let handles: Vec<(PeerId, PeerHandle)> =
            self.inner.peers.lock().await.drain().collect();
        let wait = self.inner.config.timeouts.close();
        join_all(
            handles
                .into_iter()
                .map(|(peer, handle)| handle.shutdown(peer, wait)),
        )
        .await;
        info!("all peers stopped");
    }
}

/// Resolves once `state` reads anything but `Connected`, or its peer is gone.
async fn left_connected(mut state: watch::Receiver<PeerState>) {
    loop {
        if *state.borrow_and_update() != PeerState::Connected {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Recomputes the any-connected flag from the peer map after every state
/// change or unlink.
async fn track_any_connected(
    inner: Weak<RegistryInner>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    flag: watch::Sender<bool>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Diagnostic { .. }) => continue,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let connected = inner
            .peers
            .lock()
            .await
            .values()
            .any(|h| *h.state.borrow() == PeerState::Connected);
        flag.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}
