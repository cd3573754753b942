//! Typed channels: a stream of length-prefixed items carried over one pipe
//!
//! Each item is written as a big-endian `u32` length followed by the encoded
//! item. The reader keeps any trailing partial item buffered until the rest
//! arrives; only a pipe that completes mid-item, an item that fails to
//! decode, or a length above the item limit is an error, and it fails the
//! pipe without touching the session. The item limit defaults to the pipe's
//! flow-control window, which bounds what the reader ever buffers.

use crate::codec::{BincodeCodec, PayloadCodec};
use crate::error::PipeError;
use crate::pipe::{NexusPipe, PipeReader, PipeWriter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nexnet_proto::PipeId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tracing::warn;

const LENGTH_PREFIX: usize = 4;

/// Writes typed items to a pipe
pub struct ChannelWriter<T, C = BincodeCodec> {
    writer: PipeWriter,
    max_item_size: usize,
    _marker: PhantomData<fn(T, C)>,
}

impl<T: Serialize, C: PayloadCodec> ChannelWriter<T, C> {
    pub fn new(writer: PipeWriter) -> Self {
        let max_item_size = writer.window() as usize;
        Self {
            writer,
            max_item_size,
            _marker: PhantomData,
        }
    }

    /// Refuse to send items whose encoding exceeds `max` bytes
    pub fn with_max_item_size(mut self, max: usize) -> Self {
        self.max_item_size = max;
        self
    }

    pub fn id(&self) -> PipeId {
        self.writer.id()
    }

    fn encode_into(buf: &mut BytesMut, item: &T, max_item_size: usize) -> Result<(), PipeError> {
        let body = C::encode(item)?;
        if body.len() > max_item_size {
            return Err(PipeError::Codec(format!(
                "item of {} bytes exceeds the {} byte limit",
                body.len(),
                max_item_size
            )));
        }
        let len = u32::try_from(body.len())
            .map_err(|_| PipeError::Codec(format!("item too large: {} bytes", body.len())))?;
        buf.reserve(LENGTH_PREFIX + body.len());
        buf.put_u32(len);
        buf.extend_from_slice(&body);
        Ok(())
    }

    pub async fn write(&mut self, item: &T) -> Result<(), PipeError> {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, item, self.max_item_size)?;
        self.writer.write(buf.freeze()).await
    }

    /// Write several items with a single pipe write
    pub async fn write_batch(&mut self, items: &[T]) -> Result<(), PipeError> {
        let mut buf = BytesMut::new();
        for item in items {
            Self::encode_into(&mut buf, item, self.max_item_size)?;
        }
        self.writer.write(buf.freeze()).await
    }

    /// No more items will be written
    pub async fn complete(&mut self) -> Result<(), PipeError> {
        self.writer.complete().await
    }

    pub fn into_inner(self) -> PipeWriter {
        self.writer
    }
}

/// Reads typed items from a pipe
pub struct ChannelReader<T, C = BincodeCodec> {
    reader: PipeReader,
    buffer: BytesMut,
    max_item_size: usize,
    _marker: PhantomData<fn() -> (T, C)>,
}

impl<T: DeserializeOwned, C: PayloadCodec> ChannelReader<T, C> {
    pub fn new(reader: PipeReader) -> Self {
        let max_item_size = reader.window() as usize;
        Self {
            reader,
            buffer: BytesMut::new(),
            max_item_size,
            _marker: PhantomData,
        }
    }

    /// Fail the pipe on any length prefix above `max` bytes
    pub fn with_max_item_size(mut self, max: usize) -> Self {
        self.max_item_size = max;
        self
    }

    pub fn id(&self) -> PipeId {
        self.reader.id()
    }

    /// Decode one item if a complete one is buffered
    fn try_decode(&mut self) -> Result<Option<T>, PipeError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > self.max_item_size {
            let limit = self.max_item_size;
            return Err(self.fail(PipeError::Codec(format!(
                "item length {} exceeds the {} byte limit",
                len, limit
            ))));
        }
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        let body = self.buffer.split_to(len).freeze();
        match C::decode(&body) {
            Ok(item) => Ok(Some(item)),
            Err(e) => Err(self.fail(PipeError::from(e))),
        }
    }

    fn fail(&mut self, error: PipeError) -> PipeError {
        warn!(pipe_id = self.reader.id(), "Channel failed: {}", error);
        self.buffer.clear();
        self.reader.reset();
        error
    }

    fn append(&mut self, chunks: Vec<Bytes>) {
        for chunk in chunks {
            self.buffer.extend_from_slice(&chunk);
        }
    }

    fn finish(&mut self) -> Result<(), PipeError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let leftover = self.buffer.len();
        Err(self.fail(PipeError::Codec(format!(
            "pipe completed with {} bytes of a partial item",
            leftover
        ))))
    }

    /// Next item, or `None` once the writer completed
    pub async fn read(&mut self) -> Result<Option<T>, PipeError> {
        loop {
            if let Some(item) = self.try_decode()? {
                return Ok(Some(item));
            }
            match self.reader.read_batch().await? {
                Some(chunks) => self.append(chunks),
                None => {
                    self.finish()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Deliver decoded items in batches until the writer completes; returns the item count
    pub async fn read_until_complete<F>(&mut self, mut on_items: F) -> Result<usize, PipeError>
    where
        F: FnMut(Vec<T>),
    {
        let mut total = 0;
        loop {
            let mut items = Vec::new();
            while let Some(item) = self.try_decode()? {
                items.push(item);
            }
            if !items.is_empty() {
                total += items.len();
                on_items(items);
            }

            match self.reader.read_batch().await? {
                Some(chunks) => self.append(chunks),
                None => {
                    self.finish()?;
                    return Ok(total);
                }
            }
        }
    }

    /// Collect every item until the writer completes
    pub async fn collect(&mut self) -> Result<Vec<T>, PipeError> {
        let mut out = Vec::new();
        self.read_until_complete(|items| out.extend(items)).await?;
        Ok(out)
    }

    pub fn into_inner(self) -> PipeReader {
        self.reader
    }
}

/// Bidirectional typed channel over one pipe
pub struct NexusChannel<T, C = BincodeCodec> {
    reader: ChannelReader<T, C>,
    writer: ChannelWriter<T, C>,
}

impl<T, C> NexusChannel<T, C>
where
    T: Serialize + DeserializeOwned,
    C: PayloadCodec,
{
    pub fn new(pipe: NexusPipe) -> Self {
        let (reader, writer) = pipe.split();
        Self {
            reader: ChannelReader::new(reader),
            writer: ChannelWriter::new(writer),
        }
    }

    /// Item size limit applied to both directions
    pub fn with_max_item_size(self, max: usize) -> Self {
        Self {
            reader: self.reader.with_max_item_size(max),
            writer: self.writer.with_max_item_size(max),
        }
    }

    pub fn id(&self) -> PipeId {
        self.writer.id()
    }

    pub async fn write(&mut self, item: &T) -> Result<(), PipeError> {
        self.writer.write(item).await
    }

    pub async fn write_batch(&mut self, items: &[T]) -> Result<(), PipeError> {
        self.writer.write_batch(items).await
    }

    pub async fn complete(&mut self) -> Result<(), PipeError> {
        self.writer.complete().await
    }

    pub async fn read(&mut self) -> Result<Option<T>, PipeError> {
        self.reader.read().await
    }

    pub async fn read_until_complete<F>(&mut self, on_items: F) -> Result<usize, PipeError>
    where
        F: FnMut(Vec<T>),
    {
        self.reader.read_until_complete(on_items).await
    }

    pub async fn collect(&mut self) -> Result<Vec<T>, PipeError> {
        self.reader.collect().await
    }

    pub fn split(self) -> (ChannelReader<T, C>, ChannelWriter<T, C>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::pipe::{PipeParams, PipeShared, PipeTable};
    use crate::sink::FrameSink;
    use crate::stats::SessionStats;
    use nexnet_proto::FrameCodec;
    use nexnet_transport::BoxedWriter;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::codec::FramedWrite;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: u32,
        value: f64,
    }

    fn local_pipe() -> (Arc<PipeShared>, Arc<PipeTable>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let writer: BoxedWriter = Box::new(local);
        let sink = FrameSink::new(
            FramedWrite::new(writer, FrameCodec::new()),
            Arc::new(SessionStats::default()),
        );
        let table = Arc::new(PipeTable::new());
        let params = PipeParams {
            max_chunk: 1024,
            window: 1 << 20,
            open_timeout: Duration::from_secs(1),
        };
        let shared = PipeShared::new(2, false, sink, Arc::downgrade(&table), params);
        table.insert(2, shared.clone());
        (shared, table, remote)
    }

    fn encode_items(items: &[Reading]) -> Bytes {
        let mut buf = BytesMut::new();
        for item in items {
            ChannelWriter::<Reading, BincodeCodec>::encode_into(&mut buf, item, usize::MAX).unwrap();
        }
        buf.freeze()
    }

    fn readings(count: u32) -> Vec<Reading> {
        (0..count)
            .map(|i| Reading {
                sensor: i,
                value: i as f64 * 0.5,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_items_split_across_chunks() {
        let (shared, _table, _remote) = local_pipe();
        let mut reader: ChannelReader<Reading> =
            ChannelReader::new(NexusPipe::new(shared.clone()).split().0);

        let items = readings(10);
        let wire = encode_items(&items);
        // Deliver in awkward 7-byte pieces so items straddle chunk boundaries
        for piece in wire.chunks(7) {
            shared.push_data(Bytes::copy_from_slice(piece));
        }
        shared.remote_close(false);

        assert_eq!(reader.collect().await.unwrap(), items);
    }

    #[tokio::test]
    async fn test_partial_item_waits_for_rest() {
        let (shared, _table, _remote) = local_pipe();
        let mut reader: ChannelReader<Reading> =
            ChannelReader::new(NexusPipe::new(shared.clone()).split().0);

        let wire = encode_items(&readings(1));
        let (head, tail) = wire.split_at(wire.len() - 3);
        shared.push_data(Bytes::copy_from_slice(head));

        let pending = tokio::time::timeout(Duration::from_millis(20), reader.read()).await;
        assert!(pending.is_err());

        shared.push_data(Bytes::copy_from_slice(tail));
        assert_eq!(reader.read().await.unwrap(), Some(readings(1)[0].clone()));
    }

    #[tokio::test]
    async fn test_truncated_item_is_pipe_error() {
        let (shared, _table, _remote) = local_pipe();
        let mut reader: ChannelReader<Reading> =
            ChannelReader::new(NexusPipe::new(shared.clone()).split().0);

        let wire = encode_items(&readings(2));
        shared.push_data(wire.slice(..wire.len() - 1));
        shared.remote_close(false);

        assert_eq!(reader.read().await.unwrap(), Some(readings(1)[0].clone()));
        assert!(matches!(reader.read().await, Err(PipeError::Codec(_))));
    }

    #[tokio::test]
    async fn test_corrupt_item_resets_pipe() {
        let (shared, table, _remote) = local_pipe();
        let mut reader: ChannelReader<Reading, JsonCodec> =
            ChannelReader::new(NexusPipe::new(shared.clone()).split().0);

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(b"{{{");
        shared.push_data(buf.freeze());

        assert!(matches!(reader.read().await, Err(PipeError::Codec(_))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_read_until_complete_batches() {
        let (shared, _table, _remote) = local_pipe();
        let mut reader: ChannelReader<Reading> =
            ChannelReader::new(NexusPipe::new(shared.clone()).split().0);

        let items = readings(6);
        shared.push_data(encode_items(&items[..3]));
        shared.push_data(encode_items(&items[3..]));
        shared.remote_close(false);

        let mut seen = Vec::new();
        let count = reader
            .read_until_complete(|batch| seen.extend(batch))
            .await
            .unwrap();
        assert_eq!(count, 6);
        assert_eq!(seen, items);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_resets_pipe() {
        let (shared, table, _remote) = local_pipe();
        let mut reader: ChannelReader<Reading> =
            ChannelReader::new(NexusPipe::new(shared.clone()).split().0);

        // A prefix far above the window must not wait for the rest of the item
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.extend_from_slice(&[0u8; 1000]);
        shared.push_data(buf.freeze());

        let result = tokio::time::timeout(Duration::from_secs(1), reader.read())
            .await
            .expect("rejected without waiting for more data");
        assert!(matches!(result, Err(PipeError::Codec(_))));
        assert!(table.is_empty());
        assert_eq!(shared.state(), crate::pipe::PipeState::Closed);
    }

    #[tokio::test]
    async fn test_configured_item_limit() {
        let (shared, _table, _remote) = local_pipe();
        let (reader, writer) = NexusPipe::new(shared.clone()).split();
        let mut reader: ChannelReader<Reading> = ChannelReader::new(reader).with_max_item_size(8);
        let mut writer: ChannelWriter<Reading> = ChannelWriter::new(writer).with_max_item_size(8);

        let item = readings(1).remove(0);
        assert!(matches!(writer.write(&item).await, Err(PipeError::Codec(_))));

        // bincode encodes a Reading in 12 bytes
        shared.push_data(encode_items(&[item]));
        assert!(matches!(reader.read().await, Err(PipeError::Codec(_))));
    }
}
