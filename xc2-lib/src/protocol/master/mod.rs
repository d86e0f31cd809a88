mod discovery;

pub use discovery::{AddressBook, ModuleIdentity, ADDR_FIRST_ASSIGNABLE, ADDR_LAST_ASSIGNABLE};

use std::time::Duration;

use log::{debug, warn};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};

use super::{
    flags, make_codec, Codec, Command, Frame, PacketType, ProtocolError, ProtocolKind, Result,
    SysCommand, ADDR_BROADCAST, ADDR_DEFAULT, ADDR_MASTER,
};
use crate::config::{BusConfig, RetryPolicy};
use crate::port::{self, CloseHandle, Transport};

/// Bus master. Owns the transport and runs one transaction at a time.
///
/// Shared between callers through an `Arc`; waiting callers queue on the bus
/// lock in arrival order.
pub struct Master {
    bus: Mutex<Transport>,
    closer: CloseHandle,
    codec: Box<dyn Codec>,
    address: u16,
    policy: RetryPolicy,
}

impl Master {
    pub fn new(transport: Transport, closer: CloseHandle, kind: ProtocolKind) -> Self {
        Self {
            bus: Mutex::new(transport),
            closer,
            codec: make_codec(kind),
            address: ADDR_MASTER,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_address(mut self, address: u16) -> Self {
        self.address = address;
        self
    }

    /// Opens the configured serial port and builds a master on top of it.
    pub fn open(config: &BusConfig) -> anyhow::Result<Self> {
        let (transport, closer) = port::open_transport(&config.serial)?;
        Ok(Self::new(transport, closer, config.protocol)
            .with_policy(config.retry)
            .with_address(config.master_address))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.codec.kind()
    }

    /// Closes the bus. A transaction in flight fails with `TransportClosed`.
    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, Transport>> {
        if self.is_closed() {
            return Err(ProtocolError::TransportClosed);
        }

        let bus = match self.policy.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.bus.lock())
                .await
                .map_err(|_| ProtocolError::BusBusy)?,
            None => self.bus.lock().await,
        };

        if bus.is_closed() {
            return Err(ProtocolError::TransportClosed);
        }
        Ok(bus)
    }

    fn is_answer(&self, request: &Frame, frame: &Frame) -> bool {
        matches!(frame.kind, PacketType::Ack | PacketType::Nak)
            && frame.src == request.dst
            && frame.cmd == request.cmd
            && frame.dst == self.address
    }

    async fn read_frame(&self, bus: &mut Transport, deadline: Instant) -> Result<Frame> {
        let raw = bus
            .read_until(deadline, |buf| self.codec.frame_len(buf))
            .await?;
        match self.codec.decode(&raw) {
            Ok((frame, _)) => Ok(frame),
            Err(err) => {
                // framing is lost, start over with the next reply
                bus.discard_input();
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        bus: &mut Transport,
        request: &Frame,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        bus.discard_input();
        bus.write(bytes).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let frame = self.read_frame(bus, deadline).await?;

            if self.is_answer(request, &frame) {
                return Ok(frame);
            }

            match frame.kind {
                PacketType::Event | PacketType::CriticalError => {
                    debug!(
                        "skipping {:?} from {:#05x} (cmd {:#04x})",
                        frame.kind, frame.src, frame.cmd
                    );
                }
                PacketType::Command if frame.src == self.address => {
                    debug!("skipping own echo");
                }
                _ => {
                    return Err(ProtocolError::AddressMismatch {
                        src: frame.src,
                        cmd: frame.cmd,
                    })
                }
            }
        }
    }

    /// Sends `cmd` to `dst` and waits for the matching answer.
    ///
    /// Every attempt re-sends the identical frame and gets a fresh `timeout`.
    /// A NAK ends the transaction right away.
    pub async fn send_and_wait(
        &self,
        dst: u16,
        cmd: impl Into<u8>,
        data: &[u8],
        timeout: Duration,
        max_attempts: usize,
    ) -> Result<Frame> {
        if dst == ADDR_BROADCAST {
            return Err(ProtocolError::BroadcastNotAllowed);
        }

        let request = Frame::command(dst, self.address, cmd, data);
        let bytes = self.codec.encode(&request)?;
        let max_attempts = max_attempts.max(1);

        let mut bus = self.acquire().await?;
        let mut last_error = ProtocolError::Timeout;

        for attempt in 1..=max_attempts {
            match self.attempt(&mut bus, &request, &bytes, timeout).await {
                Ok(frame) => return frame.into_result(),
                Err(err) if err.is_retryable() => {
                    debug!(
                        "{:#05x} cmd {:#04x}: attempt {}/{} failed: {}",
                        dst, request.cmd, attempt, max_attempts, err
                    );
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(match last_error {
            ProtocolError::Timeout => ProtocolError::NoResponse {
                attempts: max_attempts,
            },
            err => err,
        })
    }

    /// Transaction with the default policy, returns the answer payload.
    pub async fn command(&self, dst: u16, cmd: impl Into<u8>, data: &[u8]) -> Result<Vec<u8>> {
        self.send_and_wait(
            dst,
            cmd,
            data,
            self.policy.timeout,
            self.policy.max_attempts,
        )
        .await
        .map(|frame| frame.data)
    }

    /// Sends a command the device is told not to answer.
    pub async fn send_no_response(&self, dst: u16, cmd: impl Into<u8>, data: &[u8]) -> Result<()> {
        let mut request = Frame::command(dst, self.address, cmd, data);
        request.flags |= flags::SUPPRESS_ANSWER;
        let bytes = self.codec.encode(&request)?;

        let mut bus = self.acquire().await?;
        bus.discard_input();
        bus.write(&bytes).await
    }

    pub async fn sys_command(&self, dst: u16, sub: SysCommand, args: &[u8]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(sub as u8);
        data.extend_from_slice(args);
        self.command(dst, Command::Sys, &data).await
    }

    /// Returns 1 when the module runs its bootloader, 2 for the application.
    pub async fn echo(&self, dst: u16) -> Result<u8> {
        let data = self.command(dst, Command::Echo, &[]).await?;
        data.first()
            .copied()
            .ok_or(ProtocolError::Malformed("empty echo answer"))
    }

    /// Reads `(model, serial)` of the module at `dst`.
    pub async fn read_serial_number(&self, dst: u16) -> Result<(String, String)> {
        let data = self.sys_command(dst, SysCommand::GetSerial, &[]).await?;
        discovery::parse_serial_answer(&data)
    }

    pub async fn set_address(&self, dst: u16, new_address: u16) -> Result<()> {
        if !(ADDR_MASTER..ADDR_DEFAULT).contains(&new_address) {
            return Err(ProtocolError::InvalidAddress(new_address));
        }
        self.sys_command(dst, SysCommand::SetAddress, &new_address.to_be_bytes())
            .await
            .map(|_| ())
    }

    /// Broadcasts `cmd` and collects answers until the bus stays quiet.
    ///
    /// Waits up to `timeout` for the first answer, then `quiet_period` after
    /// each further one. No retries; corrupt frames are dropped.
    pub async fn broadcast(
        &self,
        cmd: impl Into<u8>,
        data: &[u8],
        timeout: Duration,
        quiet_period: Duration,
    ) -> Result<Vec<Frame>> {
        let request = Frame::command(ADDR_BROADCAST, self.address, cmd, data);
        let bytes = self.codec.encode(&request)?;

        let mut bus = self.acquire().await?;
        bus.discard_input();
        bus.write(&bytes).await?;

        let mut answers = Vec::new();
        let mut deadline = Instant::now() + timeout;
        loop {
            match self.read_frame(&mut bus, deadline).await {
                Ok(frame)
                    if matches!(frame.kind, PacketType::Ack | PacketType::Nak)
                        && frame.cmd == request.cmd
                        && frame.dst == self.address =>
                {
                    debug!("broadcast answer from {:#05x}", frame.src);
                    answers.push(frame);
                    deadline = Instant::now() + quiet_period;
                }
                Ok(frame) => debug!("ignoring {:?} from {:#05x}", frame.kind, frame.src),
                Err(ProtocolError::Timeout) => break,
                Err(err) if err.is_decode_error() => {
                    warn!("dropping corrupt broadcast answer: {}", err)
                }
                Err(err) => return Err(err),
            }
        }

        Ok(answers)
    }
}
