//! TransportStream: the back-pressured in-memory byte pipe every
//! messaging layer reads from and writes into.
//!
//! A stream is an ordered FIFO of buffer records, each optionally
//! tagged with an opaque header. Buffers are consumed strictly in
//! order; a partially-read buffer stays at the head until exhausted; a
//! header is surfaced exactly once, by the read that starts at its
//! buffer's first byte. Writer and reader live behind separate handles
//! so different owners can hold the two ends.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Opaque per-buffer metadata, downcast by whoever knows the concrete
/// type.
pub trait StreamHeader: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

/// The one header the stack itself uses: which channel a buffer belongs
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHeader {
    pub channel_id: u32,
}

impl StreamHeader for ChannelHeader {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capability given to whoever consumes the stream.
pub trait StreamReaderEvents: Send + Sync {
    fn on_read_ready(&self);
}

/// Capability given to whoever fills the stream.
pub trait StreamWriterEvents: Send + Sync {
    fn on_write_ready(&self);
}

pub type Header = Arc<dyn StreamHeader>;

struct BufferRecord {
    data: Bytes,
    offset: usize,
    header: Option<Header>,
}

impl BufferRecord {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

struct BlockState {
    queue: BytesMut,
    header: Option<Header>,
    header_captured: bool,
}

#[derive(Default)]
struct Inner {
    buffers: VecDeque<BufferRecord>,
    block: Option<BlockState>,
    shutdown: bool,
    reader_armed: bool,
    read_ready_notified: bool,
    write_ready_notified: bool,
    reader_events: Option<Arc<dyn StreamReaderEvents>>,
    writer_events: Option<Arc<dyn StreamWriterEvents>>,
}

impl Inner {
    fn total_available(&self) -> usize {
        self.buffers.iter().map(BufferRecord::remaining).sum()
    }

    fn push_record(&mut self, data: Bytes, header: Option<Header>) {
        self.buffers.push_back(BufferRecord {
            data,
            offset: 0,
            header,
        });
        self.write_ready_notified = false;
        self.read_ready_notified = false;
    }

    fn write(&mut self, data: Bytes, header: Option<Header>) {
        if self.shutdown {
            return; // pipes swallow writes after the end
        }
        if let Some(block) = &mut self.block {
            if !block.header_captured {
                block.header = header;
                block.header_captured = true;
            }
            block.queue.extend_from_slice(&data);
            return;
        }
        self.push_record(data, header);
    }

    fn read_into(&mut self, dst: &mut [u8]) -> (usize, Option<Header>) {
        if self.shutdown {
            return (0, None);
        }

        if dst.is_empty() {
            // only a zero-sized head record is consumed by a
            // zero-length read; anything else is left untouched
            if let Some(front) = self.buffers.front_mut() {
                if front.data.is_empty() {
                    let header = front.header.take();
                    self.buffers.pop_front();
                    self.read_ready_notified = false;
                    return (0, header);
                }
            }
            return (0, None);
        }

        let mut copied = 0;
        let mut header = None;
        let mut first = true;

        while copied < dst.len() {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };

            if front.data.is_empty() {
                if first {
                    header = front.header.take();
                    self.buffers.pop_front();
                }
                // a zero-sized record terminates this read either way
                break;
            }

            // stop before a later record that carries its own header so
            // the header surfaces with its first byte
            if !first && front.offset == 0 && front.header.is_some() {
                break;
            }

            if first {
                header = front.header.take();
                first = false;
            }

            let n = front.remaining().min(dst.len() - copied);
            dst[copied..copied + n]
                .copy_from_slice(&front.data[front.offset..front.offset + n]);
            front.offset += n;
            copied += n;
            if front.remaining() == 0 {
                self.buffers.pop_front();
            }
        }

        if copied > 0 || header.is_some() {
            self.read_ready_notified = false;
        }
        (copied, header)
    }

    fn peek_into(&self, dst: &mut [u8], offset: usize) -> (usize, Option<Header>) {
        if self.shutdown {
            return (0, None);
        }

        let mut skip = offset;
        let mut copied = 0;
        let mut header = None;
        let mut first = true;

        for record in &self.buffers {
            let available = record.remaining();
            if skip >= available {
                skip -= available;
                continue;
            }
            if record.data.is_empty() {
                if first {
                    header = record.header.clone();
                }
                break;
            }
            if !first && record.offset == 0 && record.header.is_some() {
                break;
            }
            if first {
                header = record.header.clone();
                first = false;
            }
            let start = record.offset + skip;
            skip = 0;
            let n = (record.data.len() - start).min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&record.data[start..start + n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }

        (copied, header)
    }

    fn skip(&mut self, mut count: usize) -> usize {
        if self.shutdown {
            return 0;
        }
        let mut skipped = 0;
        while count > 0 {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            let available = front.remaining();
            if available == 0 {
                self.buffers.pop_front();
                continue;
            }
            let n = available.min(count);
            front.offset += n;
            count -= n;
            skipped += n;
            if front.remaining() == 0 {
                self.buffers.pop_front();
            }
        }
        if skipped > 0 {
            self.read_ready_notified = false;
        }
        skipped
    }

    /// Work out which latch transitions fire, marking them delivered.
    fn pending_notifications(
        &mut self,
    ) -> (
        Option<Arc<dyn StreamReaderEvents>>,
        Option<Arc<dyn StreamWriterEvents>>,
    ) {
        if self.shutdown {
            return (None, None);
        }
        let mut notify_reader = None;
        let mut notify_writer = None;

        if !self.buffers.is_empty() && !self.read_ready_notified {
            if let Some(events) = &self.reader_events {
                notify_reader = Some(events.clone());
                self.read_ready_notified = true;
            }
        }
        if self.buffers.is_empty() && self.reader_armed && !self.write_ready_notified {
            if let Some(events) = &self.writer_events {
                notify_writer = Some(events.clone());
                self.write_ready_notified = true;
            }
        }
        (notify_reader, notify_writer)
    }

    fn cancel(&mut self) {
        self.shutdown = true;
        self.buffers.clear();
        self.block = None;
        self.reader_events = None;
        self.writer_events = None;
    }
}

/// The shared pipe. Hand out [`StreamWriter`] / [`StreamReader`] to the
/// producing and consuming sides.
#[derive(Clone)]
pub struct TransportStream {
    inner: Arc<Mutex<Inner>>,
}

impl TransportStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            inner: self.inner.clone(),
        }
    }

    pub fn reader(&self) -> StreamReader {
        StreamReader {
            inner: self.inner.clone(),
        }
    }

    /// Idempotently shut the pipe: readers see 0, writers are ignored.
    pub fn cancel(&self) {
        self.inner.lock().cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }
}

impl Default for TransportStream {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(
    notify_reader: Option<Arc<dyn StreamReaderEvents>>,
    notify_writer: Option<Arc<dyn StreamWriterEvents>>,
) {
    // delegates run outside the stream lock
    if let Some(events) = notify_reader {
        events.on_read_ready();
    }
    if let Some(events) = notify_writer {
        events.on_write_ready();
    }
}

/// Producing end of a [`TransportStream`].
#[derive(Clone)]
pub struct StreamWriter {
    inner: Arc<Mutex<Inner>>,
}

impl StreamWriter {
    /// Append one logical buffer, optionally tagged.
    pub fn write(&self, data: Bytes, header: Option<Header>) {
        let (r, w) = {
            let mut inner = self.inner.lock();
            inner.write(data, header);
            inner.pending_notifications()
        };
        dispatch(r, w);
    }

    pub fn write_slice(&self, data: &[u8], header: Option<Header>) {
        self.write(Bytes::copy_from_slice(data), header);
    }

    pub fn write_u16(&self, value: u16, header: Option<Header>) {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()), header);
    }

    pub fn write_u32(&self, value: u32, header: Option<Header>) {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()), header);
    }

    /// Start (`true`) or flush (`false`) a write block. Writes made
    /// while blocked coalesce into one buffer whose header is the
    /// header of the block's first write.
    pub fn block(&self, on: bool) {
        let (r, w) = {
            let mut inner = self.inner.lock();
            if on {
                if inner.block.is_none() {
                    inner.block = Some(BlockState {
                        queue: BytesMut::new(),
                        header: None,
                        header_captured: false,
                    });
                }
                return;
            }
            let Some(block) = inner.block.take() else {
                return;
            };
            if !block.queue.is_empty() || block.header.is_some() {
                inner.push_record(block.queue.freeze(), block.header);
            }
            inner.pending_notifications()
        };
        dispatch(r, w);
    }

    /// Subscribe the writer-side capability; an already-drained, armed
    /// stream notifies immediately.
    pub fn subscribe(&self, events: Arc<dyn StreamWriterEvents>) {
        let (r, w) = {
            let mut inner = self.inner.lock();
            inner.writer_events = Some(events);
            inner.pending_notifications()
        };
        dispatch(r, w);
    }

    pub fn cancel(&self) {
        self.inner.lock().cancel();
    }
}

/// Consuming end of a [`TransportStream`].
#[derive(Clone)]
pub struct StreamReader {
    inner: Arc<Mutex<Inner>>,
}

impl StreamReader {
    /// One-shot arming signal: until called, the writer is never told
    /// the stream drained.
    pub fn notify_ready_to_read(&self) {
        let (r, w) = {
            let mut inner = self.inner.lock();
            inner.reader_armed = true;
            inner.pending_notifications()
        };
        dispatch(r, w);
    }

    /// Copy up to `dst.len()` bytes, crossing buffer boundaries but
    /// never past a record that carries its own header. Returns the
    /// bytes copied and the header of the first record touched, if this
    /// read was the one that first touched it.
    pub fn read(&self, dst: &mut [u8]) -> (usize, Option<Header>) {
        let (result, r, w) = {
            let mut inner = self.inner.lock();
            let result = inner.read_into(dst);
            let (r, w) = inner.pending_notifications();
            (result, r, w)
        };
        dispatch(r, w);
        result
    }

    /// Consume and return the next whole buffer.
    pub fn read_buffer(&self) -> Option<(Bytes, Option<Header>)> {
        let (result, r, w) = {
            let mut inner = self.inner.lock();
            let size = inner
                .buffers
                .front()
                .map(BufferRecord::remaining)
                .unwrap_or(0);
            let mut data = vec![0u8; size];
            let (count, header) = inner.read_into(&mut data);
            let result = if count == 0 && header.is_none() && inner.buffers.is_empty() {
                None
            } else {
                data.truncate(count);
                Some((Bytes::from(data), header))
            };
            let (r, w) = inner.pending_notifications();
            (result, r, w)
        };
        dispatch(r, w);
        result
    }

    /// Big-endian u16; `None` (nothing consumed) on underrun.
    pub fn read_u16(&self) -> Option<u16> {
        let mut buf = [0u8; 2];
        // peek first so a short stream never tears the integer
        let (count, _) = self.peek(&mut buf, 0);
        if count < 2 {
            return None;
        }
        let (count, _) = self.read(&mut buf);
        (count == 2).then(|| u16::from_be_bytes(buf))
    }

    /// Big-endian u32; `None` (nothing consumed) on underrun.
    pub fn read_u32(&self) -> Option<u32> {
        let mut buf = [0u8; 4];
        let (count, _) = self.peek(&mut buf, 0);
        if count < 4 {
            return None;
        }
        let (count, _) = self.read(&mut buf);
        (count == 4).then(|| u32::from_be_bytes(buf))
    }

    /// Non-consuming read starting `offset` bytes in.
    pub fn peek(&self, dst: &mut [u8], offset: usize) -> (usize, Option<Header>) {
        self.inner.lock().peek_into(dst, offset)
    }

    pub fn peek_u16(&self, offset: usize) -> Option<u16> {
        let mut buf = [0u8; 2];
        let (count, _) = self.peek(&mut buf, offset);
        (count == 2).then(|| u16::from_be_bytes(buf))
    }

    pub fn peek_u32(&self, offset: usize) -> Option<u32> {
        let mut buf = [0u8; 4];
        let (count, _) = self.peek(&mut buf, offset);
        (count == 4).then(|| u32::from_be_bytes(buf))
    }

    /// Discard up to `count` bytes; dropped records also drop their
    /// headers.
    pub fn skip(&self, count: usize) -> usize {
        let (skipped, r, w) = {
            let mut inner = self.inner.lock();
            let skipped = inner.skip(count);
            let (r, w) = inner.pending_notifications();
            (skipped, r, w)
        };
        dispatch(r, w);
        skipped
    }

    /// Bytes remaining in the record at the head.
    pub fn next_read_size(&self) -> usize {
        self.inner
            .lock()
            .buffers
            .front()
            .map(BufferRecord::remaining)
            .unwrap_or(0)
    }

    /// Header of the record at the head, without consuming it.
    pub fn next_read_header(&self) -> Option<Header> {
        self.inner
            .lock()
            .buffers
            .front()
            .and_then(|record| record.header.clone())
    }

    /// Number of buffer records queued.
    pub fn total_buffers(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// Total bytes readable across all records.
    pub fn total_available(&self) -> usize {
        self.inner.lock().total_available()
    }

    /// Subscribe the reader-side capability; a non-empty stream
    /// notifies immediately.
    pub fn subscribe(&self, events: Arc<dyn StreamReaderEvents>) {
        let (r, w) = {
            let mut inner = self.inner.lock();
            inner.reader_events = Some(events);
            inner.pending_notifications()
        };
        dispatch(r, w);
    }

    pub fn cancel(&self) {
        self.inner.lock().cancel();
    }
}
