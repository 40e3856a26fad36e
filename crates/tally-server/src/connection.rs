//! Per-connection protocol handler.
//!
//! A handler reads raw bytes from its client, assembles lines with a
//! [`LineDecoder`] and acts on each completed token:
//!
//! - the shutdown keyword requests server shutdown and closes the connection;
//!   input after it, even within the same read, is dropped
//! - a 9-digit token is pushed onto the hand-off queue
//! - anything else closes this connection only
//!
//! The admission permit is owned by the handler and released when it is
//! dropped, whichever way the handler exits.

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tally_core::{LineDecoder, Record, TERMINATE_KEYWORD};
use tally_dedup::RecordSender;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

/// Socket read size.
const READ_CHUNK: usize = 4096;

/// What to do with a completed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Push the record onto the hand-off queue.
    Forward(Record),
    /// Shut the whole server down.
    Terminate,
    /// Protocol violation; close this connection.
    Reject,
}

impl Dispatch {
    /// Classify a sanitized token.
    #[must_use]
    pub fn classify(token: &str) -> Self {
        if token == TERMINATE_KEYWORD {
            return Self::Terminate;
        }
        match Record::parse(token) {
            Ok(record) => Self::Forward(record),
            Err(_) => Self::Reject,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client closed its side.
    Eof,
    /// Client sent the shutdown keyword.
    Terminate,
    /// Client sent an invalid token or an overlong line.
    ProtocolViolation,
    /// Reading from the socket failed.
    Io,
    /// Server stopping cooperatively.
    Stopped,
    /// Server interrupted the read.
    Interrupted,
    /// The persistence worker is gone.
    QueueClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eof => "end of input",
            Self::Terminate => "terminate",
            Self::ProtocolViolation => "protocol violation",
            Self::Io => "read error",
            Self::Stopped => "server stopping",
            Self::Interrupted => "server interrupted",
            Self::QueueClosed => "hand-off queue closed",
        };
        f.write_str(s)
    }
}

/// Summary of one finished connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOutcome {
    /// Client address.
    pub peer: SocketAddr,
    /// Records pushed onto the hand-off queue.
    pub forwarded: u64,
    /// Why the connection ended.
    pub reason: CloseReason,
}

/// Handler for a single client connection.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    tx: RecordSender,
    signal: ShutdownSignal,
    decoder: LineDecoder,
    forwarded: u64,
    _permit: OwnedSemaphorePermit,
}

impl<S: AsyncRead + Unpin> ConnectionHandler<S> {
    /// Create a handler that holds `permit` until it exits.
    pub fn new(
        stream: S,
        peer: SocketAddr,
        tx: RecordSender,
        signal: ShutdownSignal,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            stream,
            peer,
            tx,
            signal,
            decoder: LineDecoder::new(),
            forwarded: 0,
            _permit: permit,
        }
    }

    /// Serve the connection until the client leaves, misbehaves or the
    /// server shuts down.
    pub async fn run(mut self) -> ConnectionOutcome {
        let stop = self.signal.stop_token();
        let interrupt = self.signal.interrupt_token();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        let reason = loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = interrupt.cancelled() => break CloseReason::Interrupted,
                _ = stop.cancelled() => break CloseReason::Stopped,
                read = self.stream.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => break CloseReason::Eof,
                Ok(_) => {
                    if let Some(reason) = self.feed(&buf) {
                        break reason;
                    }
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Read failed");
                    break CloseReason::Io;
                }
            }
        };

        info!(
            peer = %self.peer,
            forwarded = self.forwarded,
            reason = %reason,
            "Connection closed"
        );
        ConnectionOutcome {
            peer: self.peer,
            forwarded: self.forwarded,
            reason,
        }
    }

    /// Push `bytes` through the decoder. Returns a reason if the connection
    /// must close.
    fn feed(&mut self, bytes: &[u8]) -> Option<CloseReason> {
        for (i, &byte) in bytes.iter().enumerate() {
            let token = match self.decoder.decode(byte) {
                Ok(Some(token)) => token,
                Ok(None) => continue,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Closing connection");
                    return Some(CloseReason::ProtocolViolation);
                }
            };

            match Dispatch::classify(&token) {
                Dispatch::Forward(record) => {
                    if self.tx.send(record.into()).is_err() {
                        warn!(peer = %self.peer, %record, "Hand-off queue closed");
                        return Some(CloseReason::QueueClosed);
                    }
                    self.forwarded += 1;
                }
                Dispatch::Terminate => {
                    info!(peer = %self.peer, "Terminate received");
                    let discarded = bytes.len() - i - 1;
                    if discarded > 0 {
                        debug!(peer = %self.peer, discarded, "Dropping input after terminate");
                    }
                    self.signal.request();
                    return Some(CloseReason::Terminate);
                }
                Dispatch::Reject => {
                    warn!(peer = %self.peer, token = %token, "Invalid token, closing connection");
                    return Some(CloseReason::ProtocolViolation);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_dedup::{handoff_queue, RecordReceiver};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Semaphore;

    fn peer() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    fn drain(rx: &mut RecordReceiver) -> Vec<u32> {
        let mut values = Vec::new();
        while let Ok(item) = rx.try_recv() {
            values.push(item.record.value());
        }
        values
    }

    async fn serve(input: &[u8]) -> (ConnectionOutcome, Vec<u32>, ShutdownSignal) {
        let (mut client, server) = tokio::io::duplex(64);
        let (tx, mut rx) = handoff_queue();
        let signal = ShutdownSignal::new();
        let permits = Arc::new(Semaphore::new(1));
        let permit = permits.clone().acquire_owned().await.unwrap();

        let handler = ConnectionHandler::new(server, peer(), tx, signal.clone(), permit);
        let task = tokio::spawn(handler.run());

        // The handler may close early, so write errors are expected.
        let _ = client.write_all(input).await;
        drop(client);

        let outcome = task.await.unwrap();
        assert_eq!(permits.available_permits(), 1);
        (outcome, drain(&mut rx), signal)
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            Dispatch::classify("000000042"),
            Dispatch::Forward(Record::new(42).unwrap())
        );
        assert_eq!(Dispatch::classify("terminate"), Dispatch::Terminate);
        assert_eq!(Dispatch::classify("test"), Dispatch::Reject);
        assert_eq!(Dispatch::classify("12345678"), Dispatch::Reject);
        assert_eq!(Dispatch::classify("1234567890"), Dispatch::Reject);
        assert_eq!(Dispatch::classify("12345678a"), Dispatch::Reject);
        assert_eq!(Dispatch::classify(""), Dispatch::Reject);
        assert_eq!(Dispatch::classify("TERMINATE"), Dispatch::Reject);
    }

    #[tokio::test]
    async fn test_forwards_records_in_order() {
        let (outcome, values, signal) = serve(b"000000003\n000000001\n000000003\n").await;
        assert_eq!(outcome.reason, CloseReason::Eof);
        assert_eq!(outcome.forwarded, 3);
        assert_eq!(values, vec![3, 1, 3]);
        assert!(!signal.is_requested());
    }

    #[tokio::test]
    async fn test_backspace_edits_line() {
        let (outcome, values, _) = serve(b"0000000129\x08\n").await;
        assert_eq!(outcome.reason, CloseReason::Eof);
        assert_eq!(values, vec![12]);
    }

    #[tokio::test]
    async fn test_carriage_return_is_stripped() {
        let (_, values, _) = serve(b"000000077\r\n").await;
        assert_eq!(values, vec![77]);
    }

    #[tokio::test]
    async fn test_invalid_token_closes_connection() {
        let (outcome, values, signal) = serve(b"000000001\ntest\n000000002\n").await;
        assert_eq!(outcome.reason, CloseReason::ProtocolViolation);
        assert_eq!(values, vec![1]);
        assert!(!signal.is_requested());
    }

    #[tokio::test]
    async fn test_terminate_requests_shutdown() {
        let (outcome, values, signal) = serve(b"000000005\nterminate\n000000006\n").await;
        assert_eq!(outcome.reason, CloseReason::Terminate);
        assert_eq!(values, vec![5]);
        assert!(signal.is_requested());
        assert!(!signal.is_stopping());
    }

    #[tokio::test]
    async fn test_terminate_drops_rest_of_read() {
        let (_client, server) = tokio::io::duplex(64);
        let (tx, mut rx) = handoff_queue();
        let signal = ShutdownSignal::new();
        let permits = Arc::new(Semaphore::new(1));
        let permit = permits.clone().acquire_owned().await.unwrap();
        let mut handler = ConnectionHandler::new(server, peer(), tx, signal.clone(), permit);

        let reason = handler.feed(b"000000005\nterminate\n000000006\n000000007\n");
        assert_eq!(reason, Some(CloseReason::Terminate));
        assert_eq!(handler.forwarded, 1);
        assert_eq!(drain(&mut rx), vec![5]);
        assert!(signal.is_requested());
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        let input = vec![b'1'; 2048];
        let (outcome, values, _) = serve(&input).await;
        assert_eq!(outcome.reason, CloseReason::ProtocolViolation);
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_partial_line_at_eof_is_discarded() {
        let (outcome, values, _) = serve(b"000000008\n00000").await;
        assert_eq!(outcome.reason, CloseReason::Eof);
        assert_eq!(values, vec![8]);
    }

    #[tokio::test]
    async fn test_stop_closes_idle_connection() {
        let (_client, server) = tokio::io::duplex(64);
        let (tx, _rx) = handoff_queue();
        let signal = ShutdownSignal::new();
        let permits = Arc::new(Semaphore::new(1));
        let permit = permits.clone().acquire_owned().await.unwrap();

        let handler = ConnectionHandler::new(server, peer(), tx, signal.clone(), permit);
        let task = tokio::spawn(handler.run());
        signal.stop();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Stopped);
        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_closes_connection() {
        let (tx, rx) = handoff_queue();
        drop(rx);
        let (mut client, server) = tokio::io::duplex(64);
        let permit = Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap();
        let task = tokio::spawn(
            ConnectionHandler::new(server, peer(), tx, ShutdownSignal::new(), permit).run(),
        );

        client.write_all(b"000000001\n").await.unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::QueueClosed);
        assert_eq!(outcome.forwarded, 0);
    }
}
