//! Message delivery: compose, route, retry, receive and relay.
//!
//! Every outbound message is fanned out into one independent task per
//! recipient. Each task keeps resending its request until the recipient
//! answers "Ok" or the send is cancelled. Inbound requests addressed to
//! someone else are persisted and forwarded one hop further, with the
//! previous hop pushed onto the request's via stack so the response can
//! retrace the path.

use crate::crypto::{decrypt_and_verify, encrypt_and_sign, LocalIdentity, PeerId};
use crate::network::dht::Dht;
use crate::network::peers::{KeyFetcher, PeerCache};
use crate::storage::{StoredRecord, UndeliveredStore};
use crate::transport::protocol::{
    Message, Party, Request, Response, StatusCode, WireMessage, MAX_DATAGRAM_SIZE, MAX_HOPS,
};
use crate::utils::{MessengerConfig, MessengerError, NetworkError, Result};
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Every n-th attempt also asks the DHT, even with cached endpoints
const DHT_REFRESH_EVERY: u32 = 3;

/// Number of (call, sender) pairs remembered for dedup
const DEDUP_CAPACITY: usize = 4096;

/// (call identifier, peer)
type CallKey = (String, PeerId);

/// Behaviour knobs of the message service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Interval between resends of an unacknowledged request
    pub retry_interval: Duration,
    /// Upper bound on one DHT lookup while routing
    pub dht_timeout: Duration,
    /// Name presented in the sender header
    pub display_name: String,
}

impl ServiceSettings {
    /// Settings taken from the node configuration
    pub fn from_config(config: &MessengerConfig) -> Self {
        Self {
            retry_interval: config.timing.retry_interval(),
            dht_timeout: config.timing.dht_query_timeout(),
            display_name: config.identity.display_name.clone(),
        }
    }
}

/// Components the service works with
pub struct ServiceDeps {
    /// Local identity
    pub identity: Arc<LocalIdentity>,
    /// Known peers
    pub peers: Arc<PeerCache>,
    /// Endpoint lookups
    pub dht: Arc<dyn Dht>,
    /// Key lookups on cache misses
    pub keys: Arc<dyn KeyFetcher>,
    /// Persistence of unacknowledged messages
    pub undelivered: Arc<UndeliveredStore>,
}

/// The message transport and relay
pub struct MessageService {
    identity: Arc<LocalIdentity>,
    peers: Arc<PeerCache>,
    dht: Arc<dyn Dht>,
    keys: Arc<dyn KeyFetcher>,
    undelivered: Arc<UndeliveredStore>,
    socket: UdpSocket,
    settings: ServiceSettings,
    pending: Mutex<HashMap<CallKey, CancellationToken>>,
    delivered: Mutex<LruCache<CallKey, ()>>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    accepting: AtomicBool,
    cancel: CancellationToken,
}

impl MessageService {
    /// Bind the message socket on `address`
    pub async fn bind(
        address: SocketAddr,
        deps: ServiceDeps,
        settings: ServiceSettings,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|e| NetworkError::Transport {
                reason: format!("cannot bind {}: {}", address, e),
            })?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let capacity = NonZeroUsize::new(DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Arc::new(Self {
            identity: deps.identity,
            peers: deps.peers,
            dht: deps.dht,
            keys: deps.keys,
            undelivered: deps.undelivered,
            socket,
            settings,
            pending: Mutex::new(HashMap::new()),
            delivered: Mutex::new(LruCache::new(capacity)),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            accepting: AtomicBool::new(true),
            cancel,
        }))
    }

    /// Endpoint the message socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// How this node appears in message headers
    pub fn local_party(&self) -> Party {
        Party::new(self.identity.peer_id(), self.settings.display_name.clone())
    }

    /// Take the inbox receiver; only the first call gets it
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbox_rx.lock().take()
    }

    /// Start delivering `message` to each of its recipients.
    ///
    /// Returns once the per-recipient tasks are started; delivery is
    /// confirmed asynchronously by the recipients' "Ok" responses.
    pub fn send(self: &Arc<Self>, message: Message) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(MessengerError::ShuttingDown);
        }

        let own = self.identity.peer_id();
        let mut recipients: Vec<PeerId> = message.recipients.iter().map(|p| p.peer_id).collect();
        recipients.sort();
        recipients.dedup();

        for recipient in recipients.into_iter().filter(|r| *r != own) {
            let record = StoredRecord::Outbound {
                message: message.clone(),
                recipient,
            };
            if let Err(e) = self.undelivered.add(record) {
                log::warn!("Could not persist message {} for {}: {}", message.id, recipient, e);
            }
            self.spawn_retry(message.clone(), recipient);
        }
        Ok(())
    }

    /// Give up delivering `call_id` to `recipient`; false if it was not pending
    pub fn cancel_send(&self, call_id: &str, recipient: &PeerId) -> bool {
        let token = self
            .pending
            .lock()
            .remove(&(call_id.to_string(), *recipient));
        let Some(token) = token else {
            return false;
        };

        token.cancel();
        if let Err(e) = self.undelivered.remove(call_id, recipient) {
            log::warn!("Could not drop stored message {}: {}", call_id, e);
        }
        log::info!("Cancelled delivery of {} to {}", call_id, recipient);
        true
    }

    /// Whether `call_id` still awaits an "Ok" from `recipient`
    pub fn is_pending(&self, call_id: &str, recipient: &PeerId) -> bool {
        self.pending
            .lock()
            .contains_key(&(call_id.to_string(), *recipient))
    }

    /// Number of unacknowledged (call, recipient) pairs
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Refuse new sends; retries already running go on until cancellation
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Receive loop; runs until the service's cancellation token fires
    pub async fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        log::info!("Message service listening on {:?}", self.socket.local_addr());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => {
                        let service = Arc::clone(&self);
                        let datagram = buffer[..len].to_vec();
                        tokio::spawn(async move {
                            service.handle_datagram(&datagram, source).await;
                        });
                    }
                    Err(e) => log::debug!("Receive failed: {}", e),
                },
            }
        }

        log::info!("Message service stopped");
    }

    /// Resume work left by the previous run: outbound messages restart their
    /// retry loop, relayed requests are forwarded once more
    pub fn replay(self: &Arc<Self>) {
        let records = self.undelivered.records();
        if records.is_empty() {
            return;
        }
        log::info!("Replaying {} undelivered messages", records.len());

        for record in records {
            match record {
                StoredRecord::Outbound { message, recipient } => self.spawn_retry(message, recipient),
                StoredRecord::Relayed { request } => {
                    let service = Arc::clone(self);
                    tokio::spawn(async move {
                        let destination = request.destination;
                        let wire = WireMessage::Request(request);
                        if let Err(e) = service.route_and_send(&wire, &destination, false).await {
                            log::debug!("Replayed relay for {} not sent: {}", destination, e);
                        }
                    });
                }
            }
        }
    }

    /// Handle one inbound datagram from `source`
    pub async fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) {
        let wire = match WireMessage::from_bytes(datagram) {
            Ok(wire) => wire,
            Err(e) => {
                log::debug!("Dropping malformed datagram from {}: {}", source, e);
                return;
            }
        };
        log::trace!("Received {} from {}", wire.kind(), source);

        match wire {
            WireMessage::Request(request) => self.handle_request(request, source).await,
            WireMessage::Response(response) => self.handle_response(response, source).await,
        }
    }

    fn spawn_retry(self: &Arc<Self>, message: Message, recipient: PeerId) {
        let key = (message.id.clone(), recipient);
        let token = self.cancel.child_token();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&key) {
                return;
            }
            pending.insert(key, token.clone());
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.retry_loop(message, recipient, token).await;
        });
    }

    async fn retry_loop(&self, message: Message, recipient: PeerId, token: CancellationToken) {
        let mut request = None;
        let mut attempt: u32 = 0;

        loop {
            if request.is_none() {
                // Without the recipient's key nothing is sent
                match self.compose_request(&message, recipient).await {
                    Ok(composed) => request = Some(WireMessage::Request(composed)),
                    Err(e) if e.is_recoverable() => {
                        log::debug!("Message {} waits for a key: {}", message.id, e)
                    }
                    Err(e) => {
                        log::warn!("Giving up {} for {}: {}", message.id, recipient, e);
                        self.cancel_send(&message.id, &recipient);
                        break;
                    }
                }
            }

            if let Some(request) = &request {
                attempt += 1;
                let refresh = attempt % DHT_REFRESH_EVERY == 0;
                match self.route_and_send(request, &recipient, refresh).await {
                    Ok(sent) => log::debug!(
                        "Attempt {} of {} to {} reached {} endpoints",
                        attempt,
                        message.id,
                        recipient,
                        sent
                    ),
                    Err(e) if e.is_recoverable() => {
                        log::debug!("Attempt {} of {}: {}", attempt, message.id, e)
                    }
                    Err(e) => log::warn!("Attempt {} of {}: {}", attempt, message.id, e),
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
            }
        }
    }

    async fn compose_request(&self, message: &Message, recipient: PeerId) -> Result<Request> {
        let key = self.peers.resolve_key(&recipient, self.keys.as_ref()).await?;
        let body = encrypt_and_sign(message.content.as_bytes(), &key, self.identity.secret_key())?;

        Ok(Request {
            destination: recipient,
            topic: message.topic.clone(),
            call_id: message.id.clone(),
            date: message.signed_on,
            from: message.sender.clone(),
            to: message.recipients.clone(),
            via: Vec::new(),
            body,
        })
    }

    /// Send `wire` to every endpoint known for `destination`; returns how many
    /// sends succeeded
    async fn route_and_send(
        &self,
        wire: &WireMessage,
        destination: &PeerId,
        refresh: bool,
    ) -> Result<usize> {
        let datagram = wire.to_bytes()?;

        let mut endpoints = self.peers.endpoints(destination);
        endpoints.retain(|endpoint| !self.is_own_endpoint(endpoint));
        if endpoints.is_empty() || refresh {
            match tokio::time::timeout(self.settings.dht_timeout, self.dht.find_peers(destination)).await {
                Ok(Ok(found)) => {
                    for endpoint in found {
                        if self.is_own_endpoint(&endpoint) {
                            continue;
                        }
                        self.peers.add_endpoint(*destination, endpoint);
                        if !endpoints.contains(&endpoint) {
                            endpoints.push(endpoint);
                        }
                    }
                }
                Ok(Err(e)) => log::debug!("DHT lookup for {} failed: {}", destination, e),
                Err(_) => log::debug!("DHT lookup for {} timed out", destination),
            }
        }

        if endpoints.is_empty() {
            return Err(NetworkError::NoRoute {
                peer_id: destination.to_string(),
            }
            .into());
        }

        let sends = endpoints.iter().map(|endpoint| self.send_datagram(&datagram, *endpoint));
        Ok(join_all(sends).await.into_iter().filter(|sent| *sent).count())
    }

    /// Whether `endpoint` reaches this service's own socket
    fn is_own_endpoint(&self, endpoint: &SocketAddr) -> bool {
        let Ok(local) = self.socket.local_addr() else {
            return false;
        };
        endpoint.port() == local.port()
            && (endpoint.ip() == local.ip() || (local.ip().is_unspecified() && endpoint.ip().is_loopback()))
    }

    async fn send_datagram(&self, datagram: &[u8], endpoint: SocketAddr) -> bool {
        match self.socket.send_to(datagram, endpoint).await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Send to {} failed: {}", endpoint, e);
                false
            }
        }
    }

    async fn respond(&self, response: Response, to: SocketAddr) {
        match WireMessage::Response(response).to_bytes() {
            Ok(datagram) => {
                self.send_datagram(&datagram, to).await;
            }
            Err(e) => log::warn!("Cannot encode response for {}: {}", to, e),
        }
    }

    async fn handle_request(&self, request: Request, source: SocketAddr) {
        let own = self.identity.peer_id();
        if request.from.peer_id == own {
            // Our own request routed back to us
            log::debug!("Dropping own {} looped back from {}", request.call_id, source);
            return;
        }
        self.peers
            .add_endpoint(request.from.peer_id, request.origin().unwrap_or(source));

        if request.destination != own {
            self.relay(request, source).await;
            return;
        }

        if !self.deliver(&request).await {
            log::debug!("Duplicate {} from {}, acknowledging again", request.call_id, request.from.peer_id);
        }
        self.respond(Response::to_request(&request, own, StatusCode::Ok), source)
            .await;
    }

    async fn relay(&self, mut request: Request, source: SocketAddr) {
        if request.via.len() >= MAX_HOPS {
            log::warn!(
                "Dropping {} for {}: hop limit reached",
                request.call_id,
                request.destination
            );
            return;
        }

        let mut accepted = Response::to_request(&request, request.destination, StatusCode::Accepted);
        accepted.via.clear();
        self.respond(accepted, source).await;

        request.via.push(source);
        let record = StoredRecord::Relayed {
            request: request.clone(),
        };
        if let Err(e) = self.undelivered.add(record) {
            log::warn!("Could not persist relayed {}: {}", request.call_id, e);
        }

        let destination = request.destination;
        match self
            .route_and_send(&WireMessage::Request(request), &destination, false)
            .await
        {
            Ok(sent) => log::debug!("Relayed a request for {} to {} endpoints", destination, sent),
            Err(e) => log::warn!("Relayed request for {} kept for later: {}", destination, e),
        }
    }

    /// Put the message into the inbox unless it was delivered before
    async fn deliver(&self, request: &Request) -> bool {
        let key = (request.call_id.clone(), request.from.peer_id);
        {
            let mut delivered = self.delivered.lock();
            if delivered.contains(&key) {
                return false;
            }
            delivered.put(key, ());
        }

        let (content, decrypted) = self.open_body(request).await;
        let message = Message {
            id: request.call_id.clone(),
            topic: request.topic.clone(),
            sender: request.from.clone(),
            recipients: request.to.clone(),
            content,
            signed_on: request.date,
            decrypted,
            delivered: true,
        };

        log::info!(
            "Message {} from {} delivered (decrypted: {})",
            message.id,
            message.sender.peer_id,
            decrypted
        );
        if self.inbox_tx.send(message).is_err() {
            log::debug!("Inbox closed, message {} dropped", request.call_id);
        }
        true
    }

    /// Decrypt and verify the body; anything short of a verified body is
    /// surfaced as the raw bytes
    async fn open_body(&self, request: &Request) -> (String, bool) {
        let sender = &request.from.peer_id;
        match self.peers.resolve_key(sender, self.keys.as_ref()).await {
            Ok(key) => match decrypt_and_verify(&request.body, &key, self.identity.secret_key()) {
                Ok((body, true)) => return (String::from_utf8_lossy(&body).into_owned(), true),
                Ok((_, false)) => log::warn!("Signature of {} from {} does not verify", request.call_id, sender),
                Err(e) => log::warn!("Body of {} from {} not decrypted: {}", request.call_id, sender, e),
            },
            Err(e) => log::warn!("Body of {} from {} not decrypted: {}", request.call_id, sender, e),
        }
        (String::from_utf8_lossy(&request.body).into_owned(), false)
    }

    async fn handle_response(&self, mut response: Response, source: SocketAddr) {
        if let Some(previous_hop) = response.via.pop() {
            response.record_route.push(source);
            if response.status == StatusCode::Ok {
                if let Err(e) = self.undelivered.remove(&response.call_id, &response.peer) {
                    log::warn!("Could not drop relayed {}: {}", response.call_id, e);
                }
            }
            self.respond(response, previous_hop).await;
            return;
        }

        match response.status {
            StatusCode::Ok => {
                if let Err(e) = self.undelivered.remove(&response.call_id, &response.peer) {
                    log::warn!("Could not drop stored message {}: {}", response.call_id, e);
                }
                let token = self
                    .pending
                    .lock()
                    .remove(&(response.call_id.clone(), response.peer));
                match token {
                    Some(token) => {
                        token.cancel();
                        log::info!("Message {} acknowledged by {}", response.call_id, response.peer);
                    }
                    None => log::debug!("Repeated acknowledgement of {}", response.call_id),
                }
                self.peers
                    .add_endpoint(response.peer, response.responder_endpoint(source));
            }
            StatusCode::Accepted => {
                log::debug!("Relay {} took over {}", source, response.call_id);
            }
        }
    }
}
