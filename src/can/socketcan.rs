//! SocketCAN 适配器（仅 Linux）
//!
//! 内核级 CAN 接口的直通后端，一个接口一条总线（总线编号恒为 0）。
//! 波特率由系统工具（`ip link`）配置，不在应用层设置。

use std::io::ErrorKind;
use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tracing::{debug, trace, warn};

use super::{BusAdapter, CanError, FpsFrame};

/// SocketCAN 适配器
pub struct SocketCanBus {
    interface: String,
    name: String,
    buses: [usize; 1],
    socket: Option<CanSocket>,
    read_timeout: Duration,
}

impl SocketCanBus {
    /// 打开 CAN 接口（如 `can0`、`vcan0`）
    pub fn open(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();
        let name = format!("socketcan://{}", interface);
        let mut adapter = Self {
            interface,
            name,
            buses: [0],
            socket: None,
            read_timeout: Duration::ZERO,
        };
        adapter.connect()?;
        Ok(adapter)
    }

    fn connect(&mut self) -> Result<(), CanError> {
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            CanError::Device(format!("cannot open CAN interface {}: {}", self.interface, e))
        })?;
        self.socket = Some(socket);
        self.read_timeout = Duration::ZERO;
        debug!(device = %self.name, "SocketCAN interface opened");
        Ok(())
    }

    fn to_can_frame(frame: &FpsFrame) -> Result<CanFrame, CanError> {
        let can_frame = if frame.is_extended {
            ExtendedId::new(frame.id).and_then(|id| CanFrame::new(id, frame.data_slice()))
        } else {
            StandardId::new(frame.id as u16).and_then(|id| CanFrame::new(id, frame.data_slice()))
        };
        can_frame
            .ok_or_else(|| CanError::InvalidFrame(format!("invalid CAN id 0x{:X}", frame.id)))
    }

    fn from_can_frame(frame: &CanFrame) -> FpsFrame {
        let id = if frame.is_extended() {
            frame.raw_id() & 0x1FFF_FFFF
        } else {
            frame.raw_id() & 0x7FF
        };
        let mut out = FpsFrame::new_extended(id, frame.data());
        out.is_extended = frame.is_extended();
        out
    }
}

impl BusAdapter for SocketCanBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn buses(&self) -> &[usize] {
        &self.buses
    }

    fn send(&mut self, frame: &FpsFrame, _bus: Option<usize>) -> Result<(), CanError> {
        let socket = self.socket.as_mut().ok_or(CanError::NotConnected)?;
        let can_frame = Self::to_can_frame(frame)?;
        socket.write_frame(&can_frame).map_err(|e| {
            if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::BrokenPipe {
                CanError::Disconnected
            } else {
                CanError::Io(e)
            }
        })?;
        trace!(id = format_args!("0x{:X}", frame.id), len = frame.len, "frame sent");
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<(FpsFrame, usize)>, CanError> {
        let socket = self.socket.as_mut().ok_or(CanError::NotConnected)?;

        if self.read_timeout != timeout {
            socket.set_read_timeout(timeout)?;
            self.read_timeout = timeout;
        }

        match socket.read_frame() {
            Ok(frame) => {
                if frame.is_error_frame() {
                    warn!(device = %self.name, "CAN error frame received, ignoring");
                    return Ok(None);
                }
                Ok(Some((Self::from_can_frame(&frame), 0)))
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.socket = None;
                Err(CanError::Disconnected)
            }
            Err(e) => {
                self.socket = None;
                Err(CanError::Io(e))
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), CanError> {
        self.socket = None;
        self.connect()
    }
}
