//! Bounded in-process byte pipe joining an upload feeder to a backend write.
//!
//! The writer half ends the stream cleanly only through [`PipeWriter::close`]. Dropping it
//! any other way, including while unwinding from a failed feeder, delivers an error to the
//! reader so the backend discards the partial object instead of committing it. Dropping the
//! reader makes every later write fail with [`io::ErrorKind::BrokenPipe`], so neither side
//! can be left blocked once the other has gone.
use std::{
    io::{self, Read, Write},
    sync::mpsc::{Receiver, SyncSender, sync_channel},
};

enum Chunk {
    Data(Vec<u8>),
    Aborted,
}

/// Creates a pipe holding at most `capacity` chunks in flight.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (tx, rx) = sync_channel(capacity);
    (
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        },
        PipeWriter { tx: Some(tx) },
    )
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos == self.pending.len() {
            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.pending = data;
                    self.pos = 0;
                }
                Ok(Chunk::Aborted) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe writer dropped before the stream was closed",
                    ));
                }
                // Writer closed cleanly.
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub struct PipeWriter {
    tx: Option<SyncSender<Chunk>>,
}

impl PipeWriter {
    /// Ends the stream; the reader sees end of file once it drains what was written.
    pub fn close(mut self) {
        self.tx.take();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        tx.send(Chunk::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader has gone away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Chunk::Aborted);
        }
    }
}
