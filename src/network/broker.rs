use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::core::{Error, Result};
use crate::protocol::frame::{Echo, Frame, MAX_PAYLOAD_LEN};
use crate::util::lock;
use super::connection::SharedState;

/// Bookkeeping for the one outstanding request of a connection
struct Transaction {
    /// Reply header the open request waits for
    expected: Option<Echo>,
    /// Header of the delivered reply
    echoed: Option<Echo>,
    /// Reply payload
    response: [u8; MAX_PAYLOAD_LEN],
    /// Bytes of `response` in use
    response_len: usize,
    /// Set once a reply has been delivered
    complete: bool,
}

impl Transaction {
    fn new() -> Self {
        Transaction {
            expected: None,
            echoed: None,
            response: [0; MAX_PAYLOAD_LEN],
            response_len: 0,
            complete: false,
        }
    }

    fn open(&mut self, expected: Echo) {
        self.expected = Some(expected);
        self.echoed = None;
        self.response_len = 0;
        self.complete = false;
    }

    fn close(&mut self) {
        self.expected = None;
        self.complete = false;
    }
}

/// Closes the transaction slot however `send_and_wait` is left
struct OpenTransaction<'a>(&'a RequestBroker);

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        self.0.slot().close();
    }
}

/// Turns the link into a call/response primitive with one request in flight
pub struct RequestBroker {
    /// Connection state and write half
    shared: Arc<SharedState>,
    /// Serializes every `send_and_wait` caller
    request_lock: Mutex<()>,
    /// Single transaction slot
    transaction: StdMutex<Transaction>,
    /// Raised when a reply lands in the slot
    completion: Notify,
    /// Deadline for writing one frame
    write_timeout: Duration,
}

impl RequestBroker {
    pub(crate) fn new(shared: Arc<SharedState>, write_timeout: Duration) -> Self {
        RequestBroker {
            shared,
            request_lock: Mutex::new(()),
            transaction: StdMutex::new(Transaction::new()),
            completion: Notify::new(),
            write_timeout,
        }
    }

    /// Writes `frame` without waiting for a reply
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.shared.state().is_open() {
            return Err(Error::NotConnected);
        }

        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);

        let mut writer = timeout(self.write_timeout, self.shared.writer.lock())
            .await
            .map_err(|_| Error::timeout("writer busy"))?;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;

        match timeout(self.write_timeout, writer.write_all(&buf)).await {
            Ok(Ok(())) => {
                trace!(%frame, "frame sent");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::socket(format!("write failed: {}", e))),
            Err(_) => Err(Error::timeout(format!("write of {} stalled", frame))),
        }
    }

    /// Sends `frame` and waits for its reply.
    ///
    /// `timeout` bounds lock acquisition and the wait together. On success the
    /// reply payload is copied into `response`, truncated to its capacity,
    /// and the number of copied bytes is returned.
    pub async fn send_and_wait(&self, frame: &Frame, response: &mut [u8], timeout: Duration) -> Result<usize> {
        let expected = frame
            .expected_reply()
            .ok_or_else(|| Error::protocol(format!("{} takes no reply", frame)))?;
        let deadline = Instant::now() + timeout;

        let _guard = timeout_at(deadline, self.request_lock.lock())
            .await
            .map_err(|_| Error::timeout(format!("request lock not acquired within {:?}", timeout)))?;

        self.slot().open(expected);
        // Dropped before `_guard`, so the slot is closed while the lock is held
        let _open = OpenTransaction(self);

        self.send(frame).await?;

        if timeout_at(deadline, self.wait_for_completion()).await.is_err() {
            return Err(Error::timeout(format!("no reply to {} within {:?}", frame, timeout)));
        }

        let slot = self.slot();
        let echoed = slot.echoed;
        if echoed != Some(expected) {
            return Err(Error::protocol_mismatch(format!(
                "sent {}, peer echoed {}",
                expected,
                echoed.map(|e| e.to_string()).unwrap_or_default()
            )));
        }

        let len = slot.response_len.min(response.len());
        if slot.response_len > response.len() {
            warn!(
                reply_len = slot.response_len,
                capacity = response.len(),
                "reply truncated to caller buffer"
            );
        }
        response[..len].copy_from_slice(&slot.response[..len]);
        Ok(len)
    }

    /// Hands an inbound reply to the waiting caller.
    ///
    /// Returns false, leaving the frame to the caller, if no request is open
    /// or the frame does not have the shape of its reply. Never waits on the
    /// request lock.
    pub fn deliver_response(&self, frame: &Frame) -> bool {
        {
            let mut slot = self.slot();
            let Some(expected) = slot.expected else {
                return false;
            };
            if slot.complete || !expected.accepts(frame) {
                return false;
            }

            let payload = frame.payload();
            let len = payload.len().min(MAX_PAYLOAD_LEN);
            slot.response[..len].copy_from_slice(&payload[..len]);
            slot.response_len = len;
            slot.echoed = Some(frame.echo());
            slot.complete = true;
        }
        debug!(%frame, "reply delivered");
        self.completion.notify_waiters();
        true
    }

    /// Returns true while a request awaits its reply
    pub fn is_pending(&self) -> bool {
        self.slot().expected.is_some()
    }

    async fn wait_for_completion(&self) {
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let complete = self.slot().complete;
            if complete {
                return;
            }
            notified.await;
        }
    }

    fn slot(&self) -> MutexGuard<'_, Transaction> {
        lock(&self.transaction)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ready_broker;
    use super::*;
    use crate::core::{CommandId, ParamId, Role};
    use crate::protocol::codec::FrameCodec;
    use crate::protocol::frame::{FrameKind, Operation, STATUS_OK};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedRead;

    fn scripted_peer() -> (Arc<RequestBroker>, FramedRead<DuplexStream, FrameCodec>) {
        let (near, far) = tokio::io::duplex(1024);
        (ready_broker(near), FramedRead::new(far, FrameCodec::new()))
    }

    #[tokio::test]
    async fn test_send_and_wait_returns_reply() {
        let (broker, mut requests) = scripted_peer();

        let peer = Arc::clone(&broker);
        let responder = tokio::spawn(async move {
            let request = requests.next().await.unwrap().unwrap();
            assert_eq!(request, Frame::get(ParamId(5)));
            assert!(peer.deliver_response(&request.reply(42i32.to_le_bytes().to_vec()).unwrap()));
        });

        let mut buf = [0u8; 4];
        let n = broker
            .send_and_wait(&Frame::get(ParamId(5)), &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(i32::from_le_bytes(buf), 42);
        assert!(!broker.is_pending());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_releases_lock() {
        let (broker, mut requests) = scripted_peer();
        let mut buf = [0u8; 4];

        let started = Instant::now();
        let err = broker
            .send_and_wait(&Frame::get(ParamId(1)), &mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!broker.is_pending());

        // The unanswered request went out; a late reply is refused
        let stale = requests.next().await.unwrap().unwrap();
        assert!(!broker.deliver_response(&stale.reply(vec![0, 0, 0, 0]).unwrap()));

        // The lock is free again
        let peer = Arc::clone(&broker);
        let responder = tokio::spawn(async move {
            let request = requests.next().await.unwrap().unwrap();
            assert!(peer.deliver_response(&request.reply(vec![STATUS_OK]).unwrap()));
        });
        let n = broker
            .send_and_wait(&Frame::set(ParamId(1), 3), &mut buf, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(n, 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_operand_mismatch_is_not_timeout() {
        let (broker, mut requests) = scripted_peer();

        let peer = Arc::clone(&broker);
        tokio::spawn(async move {
            let _request = requests.next().await.unwrap().unwrap();
            let wrong = Frame::new(FrameKind::Data, Operation::Get as u8, 6, vec![1, 0, 0, 0]).unwrap();
            assert!(peer.deliver_response(&wrong));
        });

        let mut buf = [0u8; 4];
        let err = broker
            .send_and_wait(&Frame::get(ParamId(5)), &mut buf, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
        assert!(!broker.is_pending());
    }

    #[tokio::test]
    async fn test_oversize_reply_truncated() {
        let (broker, mut requests) = scripted_peer();

        let peer = Arc::clone(&broker);
        tokio::spawn(async move {
            let request = requests.next().await.unwrap().unwrap();
            assert!(peer.deliver_response(&request.reply(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap()));
        });

        let mut buf = [0u8; 4];
        let n = broker
            .send_and_wait(&Frame::get_all(), &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_one_transaction_under_concurrent_callers() {
        const CALLERS: usize = 4;
        let (broker, mut requests) = scripted_peer();

        let peer = Arc::clone(&broker);
        let responder = tokio::spawn(async move {
            for _ in 0..CALLERS {
                let request = requests.next().await.unwrap().unwrap();
                // Nothing else may be written while this request is unanswered
                let second = tokio::time::timeout(Duration::from_millis(20), requests.next()).await;
                assert!(second.is_err(), "second request in flight");
                assert!(peer.deliver_response(&request.reply(vec![STATUS_OK]).unwrap()));
            }
        });

        let done = Arc::new(AtomicUsize::new(0));
        let mut callers = Vec::new();
        for i in 0..CALLERS {
            let broker = Arc::clone(&broker);
            let done = Arc::clone(&done);
            callers.push(tokio::spawn(async move {
                let mut status = [0u8; 1];
                broker
                    .send_and_wait(&Frame::set(ParamId(i as u8), i as i32), &mut status, Duration::from_secs(2))
                    .await
                    .unwrap();
                assert_eq!(status[0], STATUS_OK);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for caller in callers {
            caller.await.unwrap();
        }
        responder.await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), CALLERS);
    }

    #[tokio::test]
    async fn test_cancelled_wait_closes_transaction() {
        let (broker, mut requests) = scripted_peer();

        let mut buf = [0u8; 4];
        let frame = Frame::get(ParamId(5));
        let call = broker.send_and_wait(&frame, &mut buf, Duration::from_secs(5));
        assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());
        assert!(!broker.is_pending());

        // The reply has no caller left and stays with the dispatcher
        let request = requests.next().await.unwrap().unwrap();
        assert!(!broker.deliver_response(&request.reply(vec![1, 0, 0, 0]).unwrap()));

        // The next caller is served normally
        let peer = Arc::clone(&broker);
        let responder = tokio::spawn(async move {
            let request = requests.next().await.unwrap().unwrap();
            assert!(peer.deliver_response(&request.reply(7i32.to_le_bytes().to_vec()).unwrap()));
        });
        let n = broker
            .send_and_wait(&Frame::get(ParamId(6)), &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(i32::from_le_bytes(buf), 7);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_frames_not_delivered() {
        let (broker, _requests) = scripted_peer();
        assert!(!broker.deliver_response(&Frame::push(ParamId(1), 1)));
        assert!(!broker.deliver_response(&Frame::command(CommandId::KEEPALIVE)));
    }

    #[tokio::test]
    async fn test_send_requires_open_link() {
        let shared = Arc::new(SharedState::new(Role::Client));
        let broker = RequestBroker::new(shared, Duration::from_millis(100));
        let err = broker.send(&Frame::get(ParamId(1))).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        let mut buf = [0u8; 4];
        let err = broker
            .send_and_wait(&Frame::get(ParamId(1)), &mut buf, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(!broker.is_pending());
    }

    #[tokio::test]
    async fn test_frames_without_reply_rejected() {
        let (broker, _requests) = scripted_peer();
        let mut buf = [0u8; 4];
        let err = broker
            .send_and_wait(&Frame::push(ParamId(1), 1), &mut buf, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
