//! CAN 适配层核心定义
//!
//! 提供统一的总线接口抽象。支持四种后端：
//!
//! - `cannet`: CAN@net NT 200/420 多总线 TCP 设备（一条 TCP 连接承载多路编号子总线）
//! - `slcan`: ASCII 行协议的串口 CAN
//! - `socketcan`: Linux SocketCAN（单总线，仅 Linux）
//! - `virtualbus`: 进程内确定性回环，用于测试
//!
//! 调度器视角下所有后端行为一致：单生产者发送、单消费者接收，
//! 收到的帧带上 `(interface_index, bus_index)` 标签后交给解复用线程。

use std::time::Duration;

use thiserror::Error;

pub mod cannet;
pub mod slcan;
pub mod virtualbus;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub use cannet::CanNetBus;
pub use slcan::SlcanBus;
pub use virtualbus::{VirtualBus, VirtualNetwork, VirtualPositioner};

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanBus;

/// 通用 CAN 帧定义（仅 CAN 2.0）
///
/// 设计要点：
/// - Copy：零成本复制，帧在线程间按值传递
/// - 固定 8 字节数据：避免堆分配
/// - 无生命周期：简化 API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsFrame {
    /// 29 位扩展仲裁 ID
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29 位 ID；定位器协议只用扩展帧）
    pub is_extended: bool,
}

impl FpsFrame {
    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
        }
    }

    /// 获取有效数据切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// 带接口/总线标签的入站帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedFrame {
    pub frame: FpsFrame,
    /// 接口在调度器接口表中的下标
    pub interface: usize,
    /// 接口内的总线编号
    pub bus: usize,
}

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    /// 底层 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 连接已断开（可尝试 `reconnect`）
    #[error("interface disconnected")]
    Disconnected,

    /// 尚未连接
    #[error("interface not connected")]
    NotConnected,

    /// 收到无法解析的帧
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// 设备层错误（配置失败、波特率不支持等）
    #[error("device error: {0}")]
    Device(String),
}

impl CanError {
    /// 是否为连接级错误（需要走重连路径）
    pub fn is_disconnection(&self) -> bool {
        matches!(self, CanError::Disconnected | CanError::Io(_))
    }
}

/// 总线适配器 trait
///
/// 语义：
/// - `send()`: Fire-and-Forget，写入底层缓冲即返回，绝不等待回复
/// - `recv()`: 阻塞直到收到一帧或超时；超时返回 `Ok(None)`
/// - 连接断开返回 `Err(CanError::Disconnected)`，由 IO 线程走重连路径
pub trait BusAdapter: Send {
    /// 适配器名称（日志用）
    fn name(&self) -> &str;

    /// 本接口承载的总线编号表
    ///
    /// 单总线后端返回 `&[0]`；多总线 TCP 设备返回打开的子总线编号。
    fn buses(&self) -> &[usize];

    /// 发送一帧
    ///
    /// `bus` 为 `None` 时发往本接口的所有总线（广播路径），
    /// 为 `Some(n)` 时只发往编号 `n` 的总线。
    fn send(&mut self, frame: &FpsFrame, bus: Option<usize>) -> Result<(), CanError>;

    /// 接收一帧及其总线编号
    ///
    /// 超时返回 `Ok(None)`；连接断开返回 `Err(Disconnected)`。
    fn recv(&mut self, timeout: Duration) -> Result<Option<(FpsFrame, usize)>, CanError>;

    /// 尝试重建连接
    ///
    /// 断开后由 IO 线程按退避间隔反复调用，直到成功。
    fn reconnect(&mut self) -> Result<(), CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new_extended() {
        let frame = FpsFrame::new_extended(0x12345678, &[0xAA, 0xBB]);
        assert_eq!(frame.id, 0x12345678);
        assert_eq!(frame.len, 2);
        assert!(frame.is_extended);
        assert_eq!(frame.data_slice(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_frame_data_truncated_to_8_bytes() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let frame = FpsFrame::new_extended(0x1, &data);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data[7], 8);
    }

    #[test]
    fn test_frame_empty_payload() {
        let frame = FpsFrame::new_extended(0x1, &[]);
        assert_eq!(frame.len, 0);
        assert_eq!(frame.data_slice().len(), 0);
    }

    #[test]
    fn test_frame_is_copy() {
        let a = FpsFrame::new_extended(0x1, &[1]);
        let b = a;
        assert_eq!(a, b);
    }

    #[test]
    fn test_can_error_is_disconnection() {
        assert!(CanError::Disconnected.is_disconnection());
        assert!(CanError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x"))
            .is_disconnection());
        assert!(!CanError::InvalidFrame("x".into()).is_disconnection());
    }
}
