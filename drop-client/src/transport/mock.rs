//! Mock transport for testing.
//!
//! Allows queueing responses and capturing sent frames for verification.
//! Unlike a socket, `recv()` parks until a response is queued or the mock
//! is hung up, so a reader task can sit on it while a test scripts the
//! relay's side of the conversation.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Mock transport for testing.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    signals: Arc<MockSignals>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    hung_up: bool,
    connected_address: Option<String>,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
}

#[derive(Debug, Default)]
struct MockSignals {
    queued: Notify,
    sent: Notify,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame to be returned by a `recv()` call.
    pub fn queue_response(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.receive_queue.push_back(data);
        drop(inner);
        self.signals.queued.notify_waiters();
    }

    /// Simulate the relay closing the connection.
    ///
    /// `recv()` drains what is already queued, then returns
    /// [`TransportError::ConnectionClosed`].
    pub fn hang_up(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.hung_up = true;
        drop(inner);
        self.signals.queued.notify_waiters();
    }

    /// Get all frames that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.clone()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.last().cloned()
    }

    /// Wait until at least `count` frames have been sent, then return all of them.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<Vec<u8>> {
        loop {
            let notified = self.signals.sent.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().unwrap();
                if inner.sent_messages.len() >= count {
                    return inner.sent_messages.clone();
                }
            }
            notified.await;
        }
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.connected_address.clone()
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
    }

    /// Clear all state (frames, queue, connection).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            signals: Arc::clone(&self.signals),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.hung_up = false;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());
        drop(inner);
        self.signals.sent.notify_waiters();
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            let notified = self.signals.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();

                if !inner.connected {
                    return Err(TransportError::NotConnected);
                }

                // Check for forced failure
                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }

                if let Some(data) = inner.receive_queue.pop_front() {
                    return Ok(data);
                }
                if inner.hung_up {
                    return Err(TransportError::ConnectionClosed);
                }
            }
            notified.await;
        }
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        drop(inner);
        self.signals.queued.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("ws://relay/ws").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(
            transport.connected_address(),
            Some("ws://relay/ws".to_string())
        );
    }

    #[tokio::test]
    async fn mock_transport_sends_frames() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();

        transport.send(b"frame 1").await.unwrap();
        transport.send(b"frame 2").await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"frame 1");
        assert_eq!(sent[1], b"frame 2");
    }

    #[tokio::test]
    async fn mock_transport_receives_queued_frames() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();

        transport.queue_response(b"response 1".to_vec());
        transport.queue_response(b"response 2".to_vec());

        assert_eq!(transport.recv().await.unwrap(), b"response 1");
        assert_eq!(transport.recv().await.unwrap(), b"response 2");
    }

    #[tokio::test]
    async fn recv_parks_until_response_is_queued() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();

        let reader = transport.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        transport.queue_response(b"late".to_vec());
        assert_eq!(pending.await.unwrap().unwrap(), b"late");
    }

    #[tokio::test]
    async fn hang_up_drains_then_closes() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();
        transport.queue_response(b"last words".to_vec());
        transport.hang_up();

        assert_eq!(transport.recv().await.unwrap(), b"last words");
        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn wait_for_sent_returns_once_count_reached() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();

        let sender = transport.clone();
        tokio::spawn(async move {
            sender.send(b"a").await.unwrap();
            sender.send(b"b").await.unwrap();
        });

        let sent = transport.wait_for_sent(2).await;
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.fail_next_connect("network unreachable");

        let result = transport.connect("relay").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn forced_recv_failure() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();
        transport.queue_response(b"data".to_vec());
        transport.fail_next_recv("timeout");

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));

        // Next recv should work (and get the queued data)
        assert_eq!(transport.recv().await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn mock_transport_reset_clears_all() {
        let transport = MockTransport::new();
        transport.connect("relay").await.unwrap();
        transport.send(b"data").await.unwrap();
        transport.queue_response(b"response".to_vec());

        transport.reset();

        assert!(!transport.is_connected());
        assert!(transport.sent_messages().is_empty());
        assert!(transport.connected_address().is_none());
        assert!(transport.last_sent().is_none());
    }
}
