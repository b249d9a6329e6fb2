//! A pull-driven byte stream with backpressure reporting.
//!
//! [`ReadableStream`] is the canonical representation of every body. A
//! producer pushes chunks through a [`StreamController`]; a single consumer
//! reads them through a [`StreamReader`]. The producer learns about
//! backpressure through [`StreamController::desired_size`], which drops to
//! zero or below once the queued bytes reach the high-water mark.
//!
//! An optional [`UnderlyingSource`] is told when the consumer wants more data
//! (`pull`) and when it gives up (`cancel`).
//!
//! ## Locking and disturbance
//! - A stream is *locked* while a reader exists or after it was teed.
//! - A stream is *disturbed* once a read was attempted, it was canceled, or
//!   it was teed. Disturbed streams can never be extracted or cloned again.
//!
//! ## Tee
//! [`ReadableStream::tee`] splits a stream into two branches. Chunks that are
//! already queued are copied into both branches, later chunks are forwarded
//! to both by the original controller. The source is only canceled once both
//! branches are canceled.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;

use crate::config::DEFAULT_HIGH_WATER_MARK;
use crate::errors::{FetchError, Result};

/// Reason handed to [`UnderlyingSource::cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum CancelReason {
    /// The consumer canceled with an error value
    Error(FetchError),
    /// The consumer canceled with a plain message
    Message(String),
    /// No reason was given
    Unspecified,
}

impl CancelReason {
    /// Normalizes the reason into an error: errors pass through, messages
    /// become generic stream errors and anything else is an abort.
    pub fn into_error(self) -> FetchError {
        match self {
            CancelReason::Error(err) => err,
            CancelReason::Message(msg) => FetchError::Stream(msg),
            CancelReason::Unspecified => FetchError::Aborted,
        }
    }
}

impl From<FetchError> for CancelReason {
    fn from(err: FetchError) -> Self {
        CancelReason::Error(err)
    }
}

impl From<&str> for CancelReason {
    fn from(msg: &str) -> Self {
        CancelReason::Message(msg.to_string())
    }
}

impl From<String> for CancelReason {
    fn from(msg: String) -> Self {
        CancelReason::Message(msg)
    }
}

/// Producer hooks invoked by the consumer side of a stream.
pub trait UnderlyingSource: Send + Sync {
    /// The consumer is ready for more data.
    fn pull(&self);

    /// The consumer canceled the stream. Called at most once.
    fn cancel(&self, reason: CancelReason);
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Readable,
    Closed,
    Errored(FetchError),
}

struct StreamState {
    phase: Phase,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    high_water_mark: usize,
    disturbed: bool,
    locked: bool,
    waker: Option<Waker>,
    source: Option<Arc<dyn UnderlyingSource>>,
    /// Set once the stream was teed; the controller then forwards to these
    branches: Option<Vec<StreamController>>,
}

impl StreamState {
    fn new(high_water_mark: usize, source: Option<Arc<dyn UnderlyingSource>>) -> Self {
        Self {
            phase: Phase::Readable,
            queue: VecDeque::new(),
            queued_bytes: 0,
            high_water_mark,
            disturbed: false,
            locked: false,
            waker: None,
            source,
            branches: None,
        }
    }

    fn desired_size(&self) -> isize {
        match self.phase {
            Phase::Readable => self.high_water_mark as isize - self.queued_bytes as isize,
            Phase::Closed | Phase::Errored(_) => 0,
        }
    }
}

type Shared = Arc<Mutex<StreamState>>;

/// A single-consumer byte stream. Cloning the handle refers to the same stream.
#[derive(Clone)]
pub struct ReadableStream {
    shared: Shared,
}

impl ReadableStream {
    /// Creates a stream and the controller used to feed it.
    pub fn new(
        high_water_mark: usize,
        source: Option<Arc<dyn UnderlyingSource>>,
    ) -> (ReadableStream, StreamController) {
        let shared = Arc::new(Mutex::new(StreamState::new(high_water_mark, source)));
        (
            ReadableStream { shared: shared.clone() },
            StreamController { shared },
        )
    }

    /// Creates a closed stream holding a single chunk.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> ReadableStream {
        let bytes = bytes.into();
        let (stream, controller) = Self::new(DEFAULT_HIGH_WATER_MARK, None);
        if !bytes.is_empty() {
            // A fresh controller always accepts the first chunk
            let _ = controller.enqueue(bytes);
        }
        controller.close();
        stream
    }

    /// Creates a closed, empty stream.
    pub fn empty() -> ReadableStream {
        Self::from_bytes(Bytes::new())
    }

    pub fn is_locked(&self) -> bool {
        self.shared.lock().locked
    }

    pub fn is_disturbed(&self) -> bool {
        self.shared.lock().disturbed
    }

    /// True when the stream can neither be read nor cloned any more.
    pub fn is_unusable(&self) -> bool {
        let st = self.shared.lock();
        st.locked || st.disturbed
    }

    /// Acquires the exclusive reader. Fails when the stream is already locked.
    pub fn get_reader(&self) -> Result<StreamReader> {
        let mut st = self.shared.lock();
        if st.locked {
            return Err(FetchError::type_error("ReadableStream is locked"));
        }
        st.locked = true;
        Ok(StreamReader {
            shared: self.shared.clone(),
        })
    }

    /// Cancels an unlocked stream, discarding queued data.
    pub fn cancel(&self, reason: impl Into<CancelReason>) -> Result<()> {
        if self.is_locked() {
            return Err(FetchError::type_error("cannot cancel a locked ReadableStream"));
        }
        cancel_shared(&self.shared, reason.into());
        Ok(())
    }

    /// Splits the stream into two independently readable branches.
    ///
    /// The stream itself becomes locked and disturbed.
    pub fn tee(&self) -> Result<(ReadableStream, ReadableStream)> {
        let mut st = self.shared.lock();
        if st.locked {
            return Err(FetchError::type_error("cannot tee a locked ReadableStream"));
        }
        st.locked = true;
        st.disturbed = true;

        let tee = Arc::new(TeeState {
            parent: self.shared.clone(),
            canceled: Mutex::new(0),
        });
        let hwm = st.high_water_mark;
        let (a, ctrl_a) = Self::new(hwm, Some(tee.clone() as Arc<dyn UnderlyingSource>));
        let (b, ctrl_b) = Self::new(hwm, Some(tee as Arc<dyn UnderlyingSource>));

        // Branches are seeded under the parent lock so forwarded chunks cannot overtake them
        let queued: Vec<Bytes> = st.queue.drain(..).collect();
        st.queued_bytes = 0;
        for ctrl in [&ctrl_a, &ctrl_b] {
            for chunk in &queued {
                let _ = ctrl.enqueue(chunk.clone());
            }
            match &st.phase {
                Phase::Readable => {}
                Phase::Closed => ctrl.close(),
                Phase::Errored(err) => ctrl.error(err.clone()),
            }
        }
        if st.phase == Phase::Readable {
            st.branches = Some(vec![ctrl_a, ctrl_b]);
        }

        Ok((a, b))
    }

    /// Reads the stream to its end and concatenates all chunks.
    pub async fn read_all(&self) -> Result<Bytes> {
        use futures::StreamExt;

        let mut reader = self.get_reader()?;
        let mut buf = Vec::new();
        while let Some(chunk) = reader.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("ReadableStream")
            .field("phase", &st.phase)
            .field("queued_bytes", &st.queued_bytes)
            .field("locked", &st.locked)
            .field("disturbed", &st.disturbed)
            .finish()
    }
}

fn cancel_shared(shared: &Shared, reason: CancelReason) {
    let (source, waker) = {
        let mut st = shared.lock();
        st.disturbed = true;
        if st.phase != Phase::Readable {
            return;
        }
        st.phase = Phase::Closed;
        st.queue.clear();
        st.queued_bytes = 0;
        (st.source.take(), st.waker.take())
    };

    if let Some(waker) = waker {
        waker.wake();
    }
    if let Some(source) = source {
        source.cancel(reason);
    }
}

/// Producer handle of a [`ReadableStream`].
#[derive(Clone)]
pub struct StreamController {
    shared: Shared,
}

impl StreamController {
    /// Queues a chunk. Fails once the stream was closed, errored or canceled.
    pub fn enqueue(&self, chunk: Bytes) -> Result<()> {
        let waker = {
            let mut st = self.shared.lock();
            if let Some(branches) = st.branches.clone() {
                drop(st);
                // A canceled branch rejects chunks; the other branch still wants them
                for branch in branches {
                    let _ = branch.enqueue(chunk.clone());
                }
                return Ok(());
            }
            if st.phase != Phase::Readable {
                return Err(FetchError::type_error("cannot enqueue into a closed stream"));
            }
            st.queued_bytes += chunk.len();
            st.queue.push_back(chunk);
            st.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Signals that no more chunks will follow. Queued chunks remain readable.
    pub fn close(&self) {
        self.terminate(Phase::Closed);
    }

    /// Puts the stream into an error state; pending and future reads fail.
    pub fn error(&self, err: FetchError) {
        self.terminate(Phase::Errored(err));
    }

    fn terminate(&self, phase: Phase) {
        let waker = {
            let mut st = self.shared.lock();
            if let Some(branches) = st.branches.take() {
                st.phase = phase.clone();
                drop(st);
                for branch in branches {
                    branch.terminate(phase.clone());
                }
                return;
            }
            if st.phase != Phase::Readable {
                return;
            }
            if matches!(phase, Phase::Errored(_)) {
                st.queue.clear();
                st.queued_bytes = 0;
            }
            st.phase = phase;
            st.source = None;
            st.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Bytes the stream can take before reaching its high-water mark.
    ///
    /// For a teed stream this is the largest value among its branches.
    pub fn desired_size(&self) -> isize {
        let branches = {
            let st = self.shared.lock();
            match &st.branches {
                Some(branches) => branches.clone(),
                None => return st.desired_size(),
            }
        };
        branches.iter().map(|b| b.desired_size()).max().unwrap_or(0)
    }

    /// True once close or error was signalled (or the consumer canceled).
    pub fn is_terminated(&self) -> bool {
        self.shared.lock().phase != Phase::Readable
    }
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("desired_size", &self.desired_size())
            .finish()
    }
}

/// Exclusive consumer of a [`ReadableStream`]. Dropping it releases the lock.
pub struct StreamReader {
    shared: Shared,
}

impl StreamReader {
    /// Reads the next chunk; `None` marks the end of the stream.
    pub async fn read(&mut self) -> Option<Result<Bytes>> {
        futures::StreamExt::next(self).await
    }

    /// Cancels the stream through the reader and releases it.
    pub fn cancel(self, reason: impl Into<CancelReason>) {
        cancel_shared(&self.shared, reason.into());
    }
}

impl Stream for StreamReader {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let (item, source) = {
            let mut st = self.shared.lock();
            st.disturbed = true;

            if let Some(chunk) = st.queue.pop_front() {
                st.queued_bytes -= chunk.len();
                // Room was made, ask for more before the queue runs dry
                let source = if st.phase == Phase::Readable && st.desired_size() > 0 {
                    st.source.clone()
                } else {
                    None
                };
                (Poll::Ready(Some(Ok(chunk))), source)
            } else {
                if st.phase == Phase::Closed {
                    return Poll::Ready(None);
                }
                if let Phase::Errored(err) = &st.phase {
                    return Poll::Ready(Some(Err(err.clone())));
                }
                st.waker = Some(cx.waker().clone());
                (Poll::Pending, st.source.clone())
            }
        };

        if let Some(source) = source {
            source.pull();
        }
        item
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.locked = false;
        st.waker = None;
    }
}

/// Shared source of both tee branches.
struct TeeState {
    parent: Shared,
    canceled: Mutex<u8>,
}

impl UnderlyingSource for TeeState {
    fn pull(&self) {
        let source = self.parent.lock().source.clone();
        if let Some(source) = source {
            source.pull();
        }
    }

    fn cancel(&self, reason: CancelReason) {
        let both = {
            let mut canceled = self.canceled.lock();
            *canceled += 1;
            *canceled == 2
        };
        if both {
            let source = {
                let mut st = self.parent.lock();
                st.branches = None;
                st.phase = Phase::Closed;
                st.source.take()
            };
            if let Some(source) = source {
                source.cancel(reason);
            }
        }
    }
}
