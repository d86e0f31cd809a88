mod virtual_bus;

pub use virtual_bus::{BusStats, VirtualBus, VirtualModule};

use std::{collections::VecDeque, time::Duration};

use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use super::{make_codec, Codec, Frame, PacketType, ProtocolError, ProtocolKind, Result};

/// Silence after which a partial frame is treated as garbage.
const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(100);

/// Module side of the bus: receives commands, sends answers.
pub struct SlaveProtocol<S> {
    port: S,
    codec: Box<dyn Codec>,
    deq: VecDeque<u8>,
    buf: [u8; 512],
}

impl<S> SlaveProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(port: S, kind: ProtocolKind) -> Self {
        Self {
            port,
            codec: make_codec(kind),
            deq: VecDeque::new(),
            buf: [0u8; 512],
        }
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    /// Bytes received but not consumed yet.
    pub fn pending(&self) -> usize {
        self.deq.len()
    }

    async fn fill(&mut self) -> Result<usize> {
        let n = self.port.read(&mut self.buf).await?;
        if n == 0 {
            return Err(ProtocolError::TransportClosed);
        }
        debug!("slave read {} bytes: {:02x?}", n, &self.buf[..n]);
        self.deq.extend(self.buf[..n].iter());
        Ok(n)
    }

    /// Waits up to `wait` for more input, returning the buffered byte count.
    pub async fn poll_pending(&mut self, wait: Duration) -> Result<usize> {
        if let Ok(res) = timeout(wait, self.fill()).await {
            res?;
        }
        Ok(self.pending())
    }

    pub async fn recv_command(&mut self) -> Result<Frame> {
        loop {
            match self.codec.decode(self.deq.make_contiguous()) {
                Ok((frame, used)) => {
                    self.deq.drain(..used);
                    if frame.kind != PacketType::Command {
                        debug!("discarding {:?} from {:#05x}", frame.kind, frame.src);
                        continue;
                    }
                    return Ok(frame);
                }
                Err(ProtocolError::Truncated) => {
                    if self.deq.is_empty() {
                        self.fill().await?;
                    } else if timeout(INTER_BYTE_TIMEOUT, self.fill()).await.is_err() {
                        // the length byte was probably garbage
                        self.deq.pop_front();
                    }
                }
                Err(err) => {
                    debug!("resync after {}", err);
                    self.deq.pop_front();
                }
            }
        }
    }

    pub async fn send_answer(&mut self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("slave write: {:02X?}", bytes);
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }
}
