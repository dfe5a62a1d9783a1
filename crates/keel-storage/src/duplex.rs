//! Request/response client multiplexed over one persistent duplex connection.
//!
//! Callers block on a single-use completion slot keyed by request ID. The
//! slot is registered before the frame is sent and is resolved exactly once:
//! by the reader thread when the response arrives, by the caller on timeout,
//! or by the disconnect path, which fails every outstanding slot so no caller
//! waits on a dead connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use keel_types::error::{KeelError, Result};

use crate::retry::RetryConfig;

/// One message on the wire. Responses echo the request ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u64,
    pub payload: Vec<u8>,
    /// Set by the peer when the request itself failed.
    pub error: Option<String>,
}

impl Frame {
    pub fn request(request_id: u64, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            payload,
            error: None,
        }
    }
}

pub trait FrameSender: Send {
    fn send(&mut self, frame: &Frame) -> Result<()>;
}

pub trait FrameReceiver: Send {
    /// Next frame, or `None` once the peer has closed the connection.
    fn recv(&mut self) -> Result<Option<Frame>>;
}

/// Opens connections; each one yields independent send and receive halves.
pub trait Transport: Send + Sync {
    fn connect(&self) -> Result<(Box<dyn FrameSender>, Box<dyn FrameReceiver>)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct DuplexConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

type Slot = Sender<Result<Vec<u8>>>;

/// A waiting caller and the connection its request was sent on.
struct PendingRequest {
    generation: u64,
    slot: Slot,
}

struct ConnSlot {
    state: ConnectionState,
    sender: Option<Box<dyn FrameSender>>,
    /// Bumped on every new connection so a stale reader cannot tear down
    /// its successor.
    generation: u64,
    closed: bool,
}

struct Shared {
    transport: Box<dyn Transport>,
    config: DuplexConfig,
    conn: Mutex<ConnSlot>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
    connects: AtomicU64,
}

impl Shared {
    fn conn(&self) -> MutexGuard<'_, ConnSlot> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition to `Disconnected` if `generation` is still current, failing
    /// every request sent on that connection. Requests already registered on
    /// a newer connection are left alone.
    fn mark_disconnected(&self, generation: u64, reason: &str) {
        {
            let mut conn = self.conn();
            if conn.generation != generation || conn.state == ConnectionState::Disconnected {
                return;
            }
            conn.state = ConnectionState::Disconnected;
            conn.sender = None;
        }
        let drained: Vec<Slot> = {
            let mut pending = self.pending();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| pending.remove(id))
                .map(|p| p.slot)
                .collect()
        };
        if !drained.is_empty() {
            warn!(
                pending = drained.len(),
                "connection lost ({reason}), failing outstanding requests"
            );
        }
        for slot in drained {
            let _ = slot.send(Err(connection_lost(reason)));
        }
    }
}

fn connection_lost(reason: &str) -> KeelError {
    KeelError::backend("request", format!("connection lost: {reason}"))
}

pub struct DuplexClient {
    shared: Arc<Shared>,
}

impl DuplexClient {
    pub fn new(transport: Box<dyn Transport>, config: DuplexConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                conn: Mutex::new(ConnSlot {
                    state: ConnectionState::Disconnected,
                    sender: None,
                    generation: 0,
                    closed: false,
                }),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                connects: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.conn().state
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending().len()
    }

    /// Send `payload` and wait for the matching response. Connection-level
    /// failures are retried with backoff up to the configured budget.
    pub fn request(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let retry = &self.shared.config.retry;
        let mut attempt = 0;
        loop {
            match self.try_request(payload) {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    attempt += 1;
                    warn!(
                        "duplex request failed (attempt {attempt}/{}), retrying: {e}",
                        retry.max_retries
                    );
                    std::thread::sleep(retry.backoff_with_jitter(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_request(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let generation = self.ensure_connected()?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (slot, completion) = bounded(1);
        self.shared
            .pending()
            .insert(request_id, PendingRequest { generation, slot });

        let sent = {
            let mut guard = self.shared.conn();
            let conn = &mut *guard;
            match conn.sender.as_mut() {
                Some(sender) if conn.generation == generation => {
                    sender.send(&Frame::request(request_id, payload.to_vec()))
                }
                _ => Err(connection_lost("replaced before send")),
            }
        };
        if let Err(e) = sent {
            self.shared.pending().remove(&request_id);
            self.shared.mark_disconnected(generation, "send failed");
            return Err(KeelError::backend("request", e));
        }

        match completion.recv_timeout(self.shared.config.request_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // The slot may have been resolved between the timeout and
                // this removal; prefer that result.
                if self.shared.pending().remove(&request_id).is_none() {
                    if let Ok(result) = completion.try_recv() {
                        return result;
                    }
                }
                Err(KeelError::backend(
                    "request",
                    format!("no response within {:?}", self.shared.config.request_timeout),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(connection_lost("slot dropped")),
        }
    }

    fn ensure_connected(&self) -> Result<u64> {
        let mut conn = self.shared.conn();
        if conn.closed {
            return Err(KeelError::Other("duplex client is closed".into()));
        }
        if conn.state == ConnectionState::Connected {
            return Ok(conn.generation);
        }
        conn.state = ConnectionState::Connecting;
        let (sender, mut receiver) = match self.shared.transport.connect() {
            Ok(halves) => halves,
            Err(e) => {
                conn.state = ConnectionState::Disconnected;
                return Err(KeelError::backend("connect", e));
            }
        };
        conn.generation += 1;
        conn.sender = Some(sender);
        conn.state = ConnectionState::Connected;
        let generation = conn.generation;
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        info!(generation, "duplex connection established");

        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name(format!("keel-duplex-reader-{generation}"))
            .spawn(move || loop {
                match receiver.recv() {
                    Ok(Some(frame)) => {
                        let waiting = shared.pending().remove(&frame.request_id);
                        match waiting {
                            Some(PendingRequest { slot, .. }) => {
                                let result = match frame.error {
                                    Some(msg) => Err(KeelError::Other(msg)),
                                    None => Ok(frame.payload),
                                };
                                let _ = slot.send(result);
                            }
                            None => debug!(
                                request_id = frame.request_id,
                                "dropping response with no waiting caller"
                            ),
                        }
                    }
                    Ok(None) => {
                        shared.mark_disconnected(generation, "closed by peer");
                        return;
                    }
                    Err(e) => {
                        shared.mark_disconnected(generation, &e.to_string());
                        return;
                    }
                }
            })?;
        Ok(generation)
    }

    /// Disconnect and refuse further requests. Outstanding callers are
    /// released with an error.
    pub fn close(&self) {
        let generation = {
            let mut conn = self.shared.conn();
            conn.closed = true;
            conn.generation
        };
        self.shared.mark_disconnected(generation, "client closed");
    }
}

impl Drop for DuplexClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::atomic::AtomicUsize;

    enum Reply {
        Respond(Frame),
        Ignore,
        Hangup,
    }

    type Behavior = Arc<dyn Fn(usize, Frame) -> Reply + Send + Sync>;

    struct ChannelSender(Sender<Frame>);
    struct ChannelReceiver(Receiver<Frame>);

    impl FrameSender for ChannelSender {
        fn send(&mut self, frame: &Frame) -> Result<()> {
            self.0
                .send(frame.clone())
                .map_err(|_| KeelError::backend("send", "peer gone"))
        }
    }

    impl FrameReceiver for ChannelReceiver {
        fn recv(&mut self) -> Result<Option<Frame>> {
            Ok(self.0.recv().ok())
        }
    }

    /// In-process peer running `behavior` for each request.
    struct Loopback {
        connects: AtomicUsize,
        fail_connects: usize,
        behavior: Behavior,
    }

    impl Transport for Loopback {
        fn connect(&self) -> Result<(Box<dyn FrameSender>, Box<dyn FrameReceiver>)> {
            let index = self.connects.fetch_add(1, Ordering::SeqCst);
            if index < self.fail_connects {
                return Err(KeelError::backend("connect", "refused"));
            }
            let (to_server, server_rx) = unbounded::<Frame>();
            let (server_tx, from_server) = unbounded::<Frame>();
            let behavior = Arc::clone(&self.behavior);
            std::thread::spawn(move || {
                for frame in server_rx {
                    match behavior(index, frame) {
                        Reply::Respond(f) => {
                            let _ = server_tx.send(f);
                        }
                        Reply::Ignore => {}
                        Reply::Hangup => break,
                    }
                }
            });
            Ok((
                Box::new(ChannelSender(to_server)),
                Box::new(ChannelReceiver(from_server)),
            ))
        }
    }

    fn echo(frame: Frame) -> Reply {
        let mut payload = frame.payload;
        payload.reverse();
        Reply::Respond(Frame::request(frame.request_id, payload))
    }

    fn client(fail_connects: usize, behavior: Behavior) -> DuplexClient {
        DuplexClient::new(
            Box::new(Loopback {
                connects: AtomicUsize::new(0),
                fail_connects,
                behavior,
            }),
            DuplexConfig {
                retry: RetryConfig {
                    max_retries: 3,
                    retry_delay_ms: 1,
                    retry_max_delay_ms: 5,
                },
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn request_roundtrip_connects_lazily() {
        let c = client(0, Arc::new(|_: usize, f: Frame| echo(f)));
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(c.request(b"abc").unwrap(), b"cba");
        assert_eq!(c.state(), ConnectionState::Connected);
        assert_eq!(c.request(b"xy").unwrap(), b"yx");
        assert_eq!(c.connect_count(), 1);
        assert_eq!(c.pending_requests(), 0);
    }

    #[test]
    fn concurrent_callers_get_their_own_responses() {
        let c = Arc::new(client(0, Arc::new(|_: usize, f: Frame| echo(f))));
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for j in 0..20u8 {
                        let resp = c.request(&[i, j]).unwrap();
                        assert_eq!(resp, vec![j, i]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.pending_requests(), 0);
    }

    #[test]
    fn peer_hangup_unblocks_and_retries_on_new_connection() {
        // First connection drops the request and hangs up.
        let c = client(
            0,
            Arc::new(|conn: usize, f: Frame| if conn == 0 { Reply::Hangup } else { echo(f) }),
        );
        assert_eq!(c.request(b"hello").unwrap(), b"olleh");
        assert_eq!(c.connect_count(), 2);
        assert_eq!(c.pending_requests(), 0);
    }

    #[test]
    fn connect_failures_are_retried_within_budget() {
        let c = client(2, Arc::new(|_: usize, f: Frame| echo(f)));
        assert_eq!(c.request(b"ok").unwrap(), b"ko");

        let hopeless = client(usize::MAX, Arc::new(|_: usize, f: Frame| echo(f)));
        let err = hopeless.request(b"x").unwrap_err();
        assert!(err.is_transient());
        assert_eq!(hopeless.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn timeout_removes_pending_slot() {
        let c = DuplexClient::new(
            Box::new(Loopback {
                connects: AtomicUsize::new(0),
                fail_connects: 0,
                behavior: Arc::new(|_: usize, _: Frame| Reply::Ignore),
            }),
            DuplexConfig {
                retry: RetryConfig {
                    max_retries: 0,
                    retry_delay_ms: 1,
                    retry_max_delay_ms: 1,
                },
                request_timeout: Duration::from_millis(50),
            },
        );
        let err = c.request(b"lost").unwrap_err();
        assert!(err.to_string().contains("no response"));
        assert_eq!(c.pending_requests(), 0);
    }

    #[test]
    fn peer_errors_are_not_retried() {
        let c = client(
            0,
            Arc::new(|_: usize, f: Frame| {
                Reply::Respond(Frame {
                    request_id: f.request_id,
                    payload: Vec::new(),
                    error: Some("no such blob".into()),
                })
            }),
        );
        let err = c.request(b"get").unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(c.connect_count(), 1);
    }

    #[test]
    fn stale_disconnect_spares_newer_requests() {
        let c = client(0, Arc::new(|_: usize, f: Frame| echo(f)));
        c.request(b"a").unwrap();
        let current = c.shared.conn().generation;

        let (old_slot, old_done) = bounded(1);
        let (new_slot, new_done) = bounded(1);
        {
            let mut pending = c.shared.pending();
            pending.insert(
                1000,
                PendingRequest {
                    generation: current,
                    slot: old_slot,
                },
            );
            // Registered on a successor connection.
            pending.insert(
                1001,
                PendingRequest {
                    generation: current + 1,
                    slot: new_slot,
                },
            );
        }

        c.shared.mark_disconnected(current, "reader failed");
        let err = old_done.try_recv().unwrap().unwrap_err();
        assert!(err.to_string().contains("reader failed"), "{err}");
        assert!(new_done.try_recv().is_err());
        assert_eq!(c.pending_requests(), 1);
        assert!(c.shared.pending().contains_key(&1001));
    }

    #[test]
    fn close_refuses_new_requests() {
        let c = client(0, Arc::new(|_: usize, f: Frame| echo(f)));
        c.request(b"a").unwrap();
        c.close();
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(c.request(b"b").is_err());
    }
}
