use std::{collections::VecDeque, sync::Arc};

use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time::{timeout_at, Instant},
};

use crate::protocol::{ProtocolError, Result};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Closes a [`Transport`] from outside, aborting any read in progress.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<watch::Sender<bool>>);

impl CloseHandle {
    pub fn close(&self) {
        // only fails without receivers, in which case there is nothing to close
        let _ = self.0.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

/// Byte-level access to the bus with deadline-bounded reads.
pub struct Transport {
    name: String,
    stream: Option<Box<dyn AsyncStream>>,
    deq: VecDeque<u8>,
    buf: [u8; 512],
    closed: watch::Receiver<bool>,
    // keeps the channel open when every handed out CloseHandle is gone
    _closer: CloseHandle,
}

impl Transport {
    pub fn new(name: &str, stream: impl AsyncStream + 'static) -> (Self, CloseHandle) {
        let (tx, rx) = watch::channel(false);
        let closer = CloseHandle(Arc::new(tx));
        let transport = Self {
            name: name.to_string(),
            stream: Some(Box::new(stream)),
            deq: VecDeque::new(),
            buf: [0u8; 512],
            closed: rx,
            _closer: closer.clone(),
        };
        (transport, closer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none() || *self.closed.borrow()
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            self.shutdown();
            return Err(ProtocolError::TransportClosed);
        }
        let stream = self.stream.as_mut().ok_or(ProtocolError::TransportClosed)?;

        debug!("{} send {:02X?}", self.name, bytes);
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads until `complete` reports the length of a complete unit at the
    /// start of the buffer and returns that unit. Bytes past it stay buffered.
    pub async fn read_until<F>(&mut self, deadline: Instant, mut complete: F) -> Result<Vec<u8>>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        if self.is_closed() {
            self.shutdown();
            return Err(ProtocolError::TransportClosed);
        }

        loop {
            if let Some(n) = complete(self.deq.make_contiguous()) {
                let unit: Vec<u8> = self.deq.drain(..n.min(self.deq.len())).collect();
                debug!("{} recv {:02X?}", self.name, unit);
                return Ok(unit);
            }

            let Self {
                stream,
                deq,
                buf,
                closed,
                ..
            } = self;
            let stream = stream.as_mut().ok_or(ProtocolError::TransportClosed)?;

            let res = tokio::select! {
                _ = closed.changed() => None,
                res = timeout_at(deadline, stream.read(buf)) => Some(res),
            };

            match res {
                None => {
                    self.shutdown();
                    return Err(ProtocolError::TransportClosed);
                }
                Some(Err(_)) => return Err(ProtocolError::Timeout),
                Some(Ok(Ok(0))) => {
                    debug!("{} end of stream", self.name);
                    self.shutdown();
                    return Err(ProtocolError::TransportClosed);
                }
                Some(Ok(Ok(n))) => deq.extend(buf[..n].iter()),
                Some(Ok(Err(err))) => return Err(err.into()),
            }
        }
    }

    /// Drops everything received so far.
    pub fn discard_input(&mut self) {
        if !self.deq.is_empty() {
            debug!("{} discard {:02X?}", self.name, self.deq);
            self.deq.clear();
        }
    }

    pub fn close(&mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.stream.take().is_some() {
            debug!("{} closed", self.name);
        }
        self.deq.clear();
    }
}
