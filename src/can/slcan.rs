//! SLCAN（串口 ASCII）适配器
//!
//! 行协议（`\r` 结尾）：
//!
//! ```text
//! T1234567828899AABBCCDDEEFF\r   扩展帧: T + 8位十六进制ID + 长度 + 数据
//! t10021122\r                    标准帧: t + 3位十六进制ID + 长度 + 数据
//! O\r / C\r                      打开 / 关闭通道
//! S8\r                           波特率（S8 = 1 Mbit/s）
//! ```
//!
//! 单总线接口，总线编号恒为 0。

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{BusAdapter, CanError, FpsFrame};

/// 串口读超时（内部轮询粒度）
const SERIAL_TIMEOUT: Duration = Duration::from_millis(10);

/// CAN 波特率对应的 SLCAN `S` 命令编号
fn bitrate_code(bitrate: u32) -> Option<u8> {
    Some(match bitrate {
        10_000 => 0,
        20_000 => 1,
        50_000 => 2,
        100_000 => 3,
        125_000 => 4,
        250_000 => 5,
        500_000 => 6,
        800_000 => 7,
        1_000_000 => 8,
        _ => return None,
    })
}

/// SLCAN 串口适配器
pub struct SlcanBus {
    path: String,
    serial_baud: u32,
    bitrate: u32,
    name: String,
    buses: [usize; 1],

    port: Option<Box<dyn serialport::SerialPort>>,
    /// 行重组缓冲（跨 `recv` 调用保留未完结的字节）
    pending: Vec<u8>,
}

impl SlcanBus {
    /// 打开串口并初始化 SLCAN 通道
    pub fn open(
        path: impl Into<String>,
        serial_baud: u32,
        bitrate: u32,
    ) -> Result<Self, CanError> {
        let path = path.into();
        let name = format!("slcan://{}", path);
        let mut adapter = Self {
            path,
            serial_baud,
            bitrate,
            name,
            buses: [0],
            port: None,
            pending: Vec::with_capacity(64),
        };
        adapter.connect()?;
        Ok(adapter)
    }

    fn connect(&mut self) -> Result<(), CanError> {
        let code = bitrate_code(self.bitrate)
            .ok_or_else(|| CanError::Device(format!("unsupported bitrate {}", self.bitrate)))?;

        let mut port = serialport::new(&self.path, self.serial_baud)
            .timeout(SERIAL_TIMEOUT)
            .open()
            .map_err(|e| CanError::Device(format!("cannot open {}: {}", self.path, e)))?;

        // 先关闭通道再重新配置，清掉设备侧残留状态
        port.write_all(b"C\r")?;
        port.write_all(format!("S{}\r", code).as_bytes())?;
        port.write_all(b"O\r")?;

        self.port = Some(port);
        self.pending.clear();

        debug!(device = %self.name, bitrate = self.bitrate, "SLCAN channel opened");
        Ok(())
    }

    /// 解析一条 SLCAN 帧记录
    fn parse_record(record: &str) -> Option<FpsFrame> {
        let mut chars = record.chars();
        let kind = chars.next()?;

        let (extended, id_digits) = match kind {
            'T' => (true, 8),
            't' => (false, 3),
            // 远程帧（R/r）与设备回应（z、版本号等）直接忽略
            _ => {
                trace!(record, "SLCAN non-data record");
                return None;
            }
        };

        let rest = &record[1..];
        if rest.len() < id_digits + 1 {
            warn!(record, "SLCAN record too short");
            return None;
        }

        let id = u32::from_str_radix(&rest[..id_digits], 16).ok()?;
        let len: usize = rest[id_digits..id_digits + 1].parse().ok()?;
        if len > 8 {
            warn!(record, "SLCAN record with invalid length");
            return None;
        }

        let hex = &rest[id_digits + 1..];
        if hex.len() < len * 2 {
            warn!(record, "SLCAN record data truncated");
            return None;
        }

        let mut data = [0u8; 8];
        for (i, slot) in data.iter_mut().take(len).enumerate() {
            *slot = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }

        let mut frame = FpsFrame::new_extended(id, &data[..len]);
        frame.is_extended = extended;
        Some(frame)
    }

    /// 编码一条 SLCAN 帧记录
    fn encode_record(frame: &FpsFrame) -> String {
        let mut record = if frame.is_extended {
            format!("T{:08X}{}", frame.id, frame.len)
        } else {
            format!("t{:03X}{}", frame.id, frame.len)
        };
        for byte in frame.data_slice() {
            record.push_str(&format!("{:02X}", byte));
        }
        record.push('\r');
        record
    }

    /// 从重组缓冲中取出下一条完整记录
    fn take_record(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\r')?;
        let record: Vec<u8> = self.pending.drain(..=end).collect();
        String::from_utf8(record[..end].to_vec()).ok()
    }
}

impl BusAdapter for SlcanBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn buses(&self) -> &[usize] {
        &self.buses
    }

    fn send(&mut self, frame: &FpsFrame, _bus: Option<usize>) -> Result<(), CanError> {
        let port = self.port.as_mut().ok_or(CanError::NotConnected)?;
        let record = Self::encode_record(frame);
        port.write_all(record.as_bytes()).map_err(|e| {
            if e.kind() == ErrorKind::BrokenPipe {
                CanError::Disconnected
            } else {
                CanError::Io(e)
            }
        })
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<(FpsFrame, usize)>, CanError> {
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if let Some(record) = self.take_record() {
                if let Some(frame) = Self::parse_record(&record) {
                    return Ok(Some((frame, 0)));
                }
                continue;
            }

            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }

            let port = self.port.as_mut().ok_or(CanError::NotConnected)?;
            let mut chunk = [0u8; 64];
            match port.read(&mut chunk) {
                Ok(0) => {
                    self.port = None;
                    return Err(CanError::Disconnected);
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue;
                }
                Err(e) => {
                    self.port = None;
                    return Err(CanError::Io(e));
                }
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), CanError> {
        self.port = None;
        self.connect()
    }
}
