use bytes::{Bytes, BytesMut};

/// Body chunks in the order they came off the wire.
#[derive(Default)]
pub(crate) struct Chunks {
    chunks: Vec<Bytes>,
    received: u64,
}

impl Chunks {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    pub(crate) fn push(&mut self, chunk: Bytes) -> u64 {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
        self.received
    }
    pub(crate) fn received(&self) -> u64 {
        self.received
    }
    /// Concatenates every chunk into one buffer of exactly `received` bytes.
    pub(crate) fn assemble(self) -> Bytes {
        log::debug!("Assembling {} chunks, {} bytes", self.chunks.len(), self.received);
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.received as usize);
        for chunk in self.chunks {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}
