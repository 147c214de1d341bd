//! CAN@net NT 200/420 多总线 TCP 适配器
//!
//! 一条 TCP 连接承载多路编号子总线，设备使用 ASCII 行协议：
//!
//! ```text
//! 主机 → 设备:  M 1 CED 18FE0201 01 02 03 04 05 06 07 08
//! 设备 → 主机:  M 2 CED 0014C800 00 01
//! 设备 → 主机:  R CAN 1 ----- 0        (健康查询响应)
//! ```
//!
//! `M` 开头的行是 CAN 帧（按总线编号解交织），其余行是设备自身的
//! 回应/事件，只记日志不进入协议栈。连接断开后由 IO 线程调用
//! `reconnect()` 重建连接并重新初始化各子总线。

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{BusAdapter, CanError, FpsFrame};

/// 设备默认 TCP 端口
pub const DEFAULT_PORT: u16 = 19228;

/// 健康查询间隔
const STATUS_PING_INTERVAL: Duration = Duration::from_secs(5);

/// 连接超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 设备支持的波特率对应的命令参数
fn bitrate_token(bitrate: u32) -> Option<&'static str> {
    Some(match bitrate {
        5_000 => "5",
        10_000 => "10",
        20_000 => "20",
        50_000 => "50",
        62_500 => "62.5",
        83_300 => "83.3",
        100_000 => "100",
        125_000 => "125",
        500_000 => "500",
        800_000 => "800",
        1_000_000 => "1000",
        _ => return None,
    })
}

/// CAN@net 多总线 TCP 适配器
pub struct CanNetBus {
    host: String,
    port: u16,
    bitrate: u32,
    buses: Vec<usize>,
    name: String,

    reader: Option<BufReader<TcpStream>>,
    writer: Option<TcpStream>,
    read_timeout: Duration,
    last_ping: Instant,
    line: String,
}

impl CanNetBus {
    /// 连接设备并初始化各子总线
    pub fn open(
        host: impl Into<String>,
        port: u16,
        bitrate: u32,
        buses: Vec<usize>,
    ) -> Result<Self, CanError> {
        let host = host.into();
        let name = format!("cannet://{}:{}", host, port);
        let mut adapter = Self {
            host,
            port,
            bitrate,
            buses,
            name,
            reader: None,
            writer: None,
            read_timeout: Duration::ZERO,
            last_ping: Instant::now(),
            line: String::with_capacity(128),
        };
        adapter.connect()?;
        Ok(adapter)
    }

    fn connect(&mut self) -> Result<(), CanError> {
        let token = bitrate_token(self.bitrate)
            .ok_or_else(|| CanError::Device(format!("unsupported bitrate {}", self.bitrate)))?;

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CanError::Device(format!("cannot resolve {}", self.host)))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;

        self.reader = Some(BufReader::new(stream));
        self.writer = Some(writer);
        self.read_timeout = Duration::ZERO;

        // 停掉可能残留的会话，重配波特率，打开全通过滤，再启动
        for bus in self.buses.clone() {
            self.write_line(&format!("CAN {} STOP", bus))?;
            self.write_line(&format!("CAN {} INIT STD {}", bus, token))?;
            self.write_line(&format!("CAN {} FILTER CLEAR", bus))?;
            self.write_line(&format!("CAN {} FILTER ADD EXT 00000000 00000000", bus))?;
            self.write_line(&format!("CAN {} START", bus))?;
        }

        self.write_line("DEV IDENTIFY")?;
        self.last_ping = Instant::now();

        debug!(device = %self.name, buses = ?self.buses, "CAN@net connected");
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), CanError> {
        let writer = self.writer.as_mut().ok_or(CanError::NotConnected)?;
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| {
                if e.kind() == ErrorKind::BrokenPipe || e.kind() == ErrorKind::ConnectionReset {
                    CanError::Disconnected
                } else {
                    CanError::Io(e)
                }
            })
    }

    /// 周期性向设备查询各总线状态，兼作链路保活
    fn ping_if_due(&mut self) -> Result<(), CanError> {
        if self.last_ping.elapsed() >= STATUS_PING_INTERVAL {
            for bus in self.buses.clone() {
                self.write_line(&format!("CAN {} STATUS", bus))?;
            }
            self.last_ping = Instant::now();
        }
        Ok(())
    }

    /// 解析一行设备输出
    ///
    /// 返回 `Some((frame, bus))` 表示 CAN 帧；设备消息与无法识别的行
    /// 记日志后返回 `None`。
    fn parse_line(line: &str, buses: &[usize]) -> Option<(FpsFrame, usize)> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let mut parts = line.split_ascii_whitespace();
        if parts.next() != Some("M") {
            // 设备自身的回应（R ...）或事件（E ...）
            trace!(message = line, "CAN@net device message");
            return None;
        }

        let bus: usize = parts.next()?.parse().ok()?;
        if !buses.contains(&bus) {
            return None;
        }

        let format = parts.next()?;
        let mut chars = format.chars();
        if chars.next() != Some('C') {
            // FD 帧不支持
            return None;
        }
        let extended = match chars.next() {
            Some('E') => true,
            Some('S') => false,
            _ => return None,
        };
        if chars.next() == Some('R') {
            // 远程帧对定位器协议没有意义
            return None;
        }

        let id = u32::from_str_radix(parts.next()?, 16).ok()?;

        let mut data = [0u8; 8];
        let mut len = 0usize;
        for byte in parts {
            if len >= 8 {
                warn!(line, "CAN@net frame with more than 8 data bytes");
                return None;
            }
            data[len] = u8::from_str_radix(byte, 16).ok()?;
            len += 1;
        }

        let mut frame = FpsFrame::new_extended(id, &data[..len]);
        frame.is_extended = extended;
        Some((frame, bus))
    }
}

impl BusAdapter for CanNetBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn buses(&self) -> &[usize] {
        &self.buses
    }

    fn send(&mut self, frame: &FpsFrame, bus: Option<usize>) -> Result<(), CanError> {
        let targets: Vec<usize> = match bus {
            Some(b) => vec![b],
            None => self.buses.clone(),
        };

        for bus in targets {
            let mut line = if frame.is_extended {
                format!("M {} CED {:08X}", bus, frame.id)
            } else {
                format!("M {} CSD {:03X}", bus, frame.id)
            };
            for byte in frame.data_slice() {
                line.push_str(&format!(" {:02X}", byte));
            }
            self.write_line(&line)?;
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<(FpsFrame, usize)>, CanError> {
        self.ping_if_due()?;

        let reader = self.reader.as_mut().ok_or(CanError::NotConnected)?;

        if self.read_timeout != timeout {
            reader.get_ref().set_read_timeout(Some(timeout))?;
            self.read_timeout = timeout;
        }

        self.line.clear();
        match reader.read_line(&mut self.line) {
            Ok(0) => {
                self.reader = None;
                self.writer = None;
                Err(CanError::Disconnected)
            }
            Ok(_) => Ok(Self::parse_line(&self.line, &self.buses)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => {
                self.reader = None;
                self.writer = None;
                if e.kind() == ErrorKind::ConnectionReset || e.kind() == ErrorKind::BrokenPipe {
                    Err(CanError::Disconnected)
                } else {
                    Err(CanError::Io(e))
                }
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), CanError> {
        self.reader = None;
        self.writer = None;
        self.connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extended_data_frame() {
        let (frame, bus) =
            CanNetBus::parse_line("M 2 CED 18FE0201 01 02 03 04 05 06 07 08", &[1, 2]).unwrap();
        assert_eq!(bus, 2);
        assert_eq!(frame.id, 0x18FE0201);
        assert!(frame.is_extended);
        assert_eq!(frame.data_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_parse_standard_frame() {
        let (frame, bus) = CanNetBus::parse_line("M 1 CSD 100 55 AA", &[1]).unwrap();
        assert_eq!(bus, 1);
        assert_eq!(frame.id, 0x100);
        assert!(!frame.is_extended);
        assert_eq!(frame.data_slice(), &[0x55, 0xAA]);
    }

    #[test]
    fn test_parse_ignores_device_messages() {
        assert!(CanNetBus::parse_line("R OK", &[1]).is_none());
        assert!(CanNetBus::parse_line("R CAN 1 ----- 0", &[1]).is_none());
        assert!(CanNetBus::parse_line("E 1 bus off", &[1]).is_none());
    }

    #[test]
    fn test_parse_ignores_unopened_bus() {
        assert!(CanNetBus::parse_line("M 3 CED 00000001 00", &[1, 2]).is_none());
    }

    #[test]
    fn test_parse_ignores_remote_frames() {
        assert!(CanNetBus::parse_line("M 1 CER 18FE0201", &[1]).is_none());
    }

    #[test]
    fn test_parse_empty_payload() {
        let (frame, _) = CanNetBus::parse_line("M 1 CED 00000301", &[1]).unwrap();
        assert_eq!(frame.len, 0);
    }

    #[test]
    fn test_bitrate_tokens() {
        assert_eq!(bitrate_token(1_000_000), Some("1000"));
        assert_eq!(bitrate_token(500_000), Some("500"));
        assert!(bitrate_token(123).is_none());
    }
}
