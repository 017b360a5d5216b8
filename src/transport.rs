//! Reconnecting websocket transport.
//!
//! The socket lives on a worker thread. The channel sees only
//! [`TransportEvent`]s coming in and text frames going out, both over
//! `std::sync::mpsc`.

use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};
use tungstenite::{stream::MaybeTlsStream, Message as WsMessage, WebSocket};
use url::Url;

/// What the worker reports to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was (re)established; treat it as a fresh session.
    Open,
    /// One whole text frame.
    Frame(String),
    /// The connection was lost; a reconnect is scheduled.
    Close,
}

/// Outbound half of a transport as seen by the channel.
pub trait FrameSink {
    /// Queues a frame. Dropped silently when not connected.
    fn send(&self, frame: String);
}

/// Exponential reconnect delay: `initial`, doubled per failed attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub backoff: Backoff,
    /// Sleep between socket polls when there is nothing to read or write.
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            poll_interval: Duration::from_millis(8),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    shutdown: AtomicBool,
}

/// Cloneable handle to a running transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<String>,
    shared: Arc<Shared>,
}

impl TransportHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Stops the worker after its current poll; no further events are sent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

impl FrameSink for TransportHandle {
    fn send(&self, frame: String) {
        if !self.is_connected() {
            debug!(target: "notify.transport", "dropping frame while disconnected");
            return;
        }
        if self.outbound.send(frame).is_err() {
            debug!(target: "notify.transport", "transport worker is gone");
        }
    }
}

pub struct Transport;

impl Transport {
    /// Starts the worker thread for `endpoint`.
    pub fn spawn(
        endpoint: Url,
        config: TransportConfig,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (out_tx, out_rx) = mpsc::channel::<String>();
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>();
        let shared = Arc::new(Shared::default());

        let worker = Worker {
            endpoint,
            config,
            shared: Arc::clone(&shared),
            outbound: out_rx,
            events: event_tx,
        };
        thread::spawn(move || worker.run());

        (
            TransportHandle {
                outbound: out_tx,
                shared,
            },
            event_rx,
        )
    }
}

enum Exit {
    Disconnected,
    Stopped,
}

struct Worker {
    endpoint: Url,
    config: TransportConfig,
    shared: Arc<Shared>,
    outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
}

impl Worker {
    fn stopping(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn emit(&self, event: TransportEvent) -> bool {
        if self.events.send(event).is_err() {
            // Nobody is listening any more.
            self.shared.shutdown.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn run(self) {
        let mut attempt: u32 = 0;

        while !self.stopping() {
            match tungstenite::connect(self.endpoint.as_str()) {
                Ok((mut socket, _response)) => {
                    if let Err(err) = set_nonblocking(socket.get_mut()) {
                        warn!(target: "notify.transport", error = %err, "failed to configure socket");
                        let _ = socket.close(None);
                    } else {
                        info!(target: "notify.transport", endpoint = %self.endpoint, "connected");
                        attempt = 0;
                        // Frames queued for a previous session are stale.
                        while self.outbound.try_recv().is_ok() {}
                        self.shared.connected.store(true, Ordering::Release);

                        let exit = if self.emit(TransportEvent::Open) {
                            self.pump(&mut socket)
                        } else {
                            Exit::Stopped
                        };

                        self.shared.connected.store(false, Ordering::Release);
                        match exit {
                            Exit::Stopped => {
                                let _ = socket.close(None);
                                let _ = socket.flush();
                                break;
                            }
                            Exit::Disconnected => {
                                warn!(target: "notify.transport", endpoint = %self.endpoint, "disconnected");
                                if !self.emit(TransportEvent::Close) {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "notify.transport", endpoint = %self.endpoint, error = %err, "connect failed");
                }
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                target: "notify.transport",
                delay_ms = delay.as_millis() as u64,
                attempt,
                "reconnecting"
            );
            self.sleep(delay);
        }

        debug!(target: "notify.transport", "transport worker stopped");
    }

    /// Moves frames both ways until the connection drops or shutdown is requested.
    fn pump(&self, socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> Exit {
        loop {
            if self.stopping() {
                return Exit::Stopped;
            }

            let mut idle = true;
            match socket.read() {
                Ok(WsMessage::Text(text)) => {
                    idle = false;
                    if !self.emit(TransportEvent::Frame(text)) {
                        return Exit::Stopped;
                    }
                }
                Ok(WsMessage::Close(_)) => return Exit::Disconnected,
                Ok(_) => idle = false,
                Err(err) => {
                    if !would_block(&err) {
                        debug!(target: "notify.transport", error = %err, "read failed");
                        return Exit::Disconnected;
                    }
                }
            }

            while let Ok(frame) = self.outbound.try_recv() {
                idle = false;
                if let Err(err) = socket.send(WsMessage::Text(frame)) {
                    if !would_block(&err) {
                        debug!(target: "notify.transport", error = %err, "write failed");
                        return Exit::Disconnected;
                    }
                }
            }
            // A frame that hit WouldBlock sits in the write buffer until flushed.
            if let Err(err) = flush_pending(socket) {
                debug!(target: "notify.transport", error = %err, "flush failed");
                return Exit::Disconnected;
            }

            if idle {
                thread::sleep(self.config.poll_interval);
            }
        }
    }

    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let slice = self.config.poll_interval.max(Duration::from_millis(1));
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

fn would_block(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(io_err) if io_err.kind() == ErrorKind::WouldBlock)
}

/// Flushes buffered outbound frames; a full socket is retried on the next poll.
fn flush_pending<S: Read + Write>(socket: &mut WebSocket<S>) -> tungstenite::Result<()> {
    match socket.flush() {
        Err(err) if would_block(&err) => Ok(()),
        other => other,
    }
}

fn set_nonblocking(stream: &mut MaybeTlsStream<TcpStream>) -> std::io::Result<()> {
    match stream {
        MaybeTlsStream::Plain(tcp) => tcp.set_nonblocking(true),
        MaybeTlsStream::Rustls(tls) => tls.sock.set_nonblocking(true),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tungstenite::protocol::Role;

    /// Refuses the first `blocked_writes` writes, then records everything.
    struct ChokedStream {
        blocked_writes: usize,
        written: Vec<u8>,
    }

    impl Read for ChokedStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(ErrorKind::WouldBlock))
        }
    }

    impl Write for ChokedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocked_writes > 0 {
                self.blocked_writes -= 1;
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn blocked_frame_goes_out_on_next_flush() {
        let stream = ChokedStream {
            blocked_writes: 1,
            written: Vec::new(),
        };
        let mut socket = WebSocket::from_raw_socket(stream, Role::Client, None);

        let err = socket
            .send(WsMessage::Text(r#"{"dismiss":"a1"}"#.to_string()))
            .unwrap_err();
        assert!(would_block(&err));
        assert!(socket.get_ref().written.is_empty());

        flush_pending(&mut socket).expect("flush");
        let written = &socket.get_ref().written;
        assert!(!written.is_empty());
        // FIN bit plus text opcode
        assert_eq!(written[0], 0x81);
    }

    #[test]
    fn flush_tolerates_a_full_socket() {
        let stream = ChokedStream {
            blocked_writes: usize::MAX,
            written: Vec::new(),
        };
        let mut socket = WebSocket::from_raw_socket(stream, Role::Client, None);
        let _ = socket.send(WsMessage::Text("{}".to_string()));
        assert!(flush_pending(&mut socket).is_ok());
        assert!(socket.get_ref().written.is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(2));
        let delays: Vec<u128> = (0..6).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 2000, 2000]);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn backoff_cap_never_below_initial() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(3), Duration::from_secs(5));
    }
}
