//! # FPS 协议层
//!
//! 定位器 CAN 总线协议定义（无硬件依赖）。
//!
//! ## 模块
//!
//! - `commands`: 固件命令操作码与命令注册表
//! - `status`: 状态字解码表（按固件版本区分）与响应码
//!
//! ## 仲裁 ID 布局
//!
//! 定位器使用 29 位扩展帧仲裁 ID，从高位到低位依次为：
//!
//! ```text
//! | positioner_id (11) | command_id (8) | uid (6) | response_code (4) |
//! ```
//!
//! `positioner_id = 0` 为广播地址；`uid = 0` 保留给广播，
//! 单播命令的 UID 从 1 开始分配。
//!
//! ## 字节序
//!
//! 负载中的多字节整数一律使用 Intel (LSB) 低位在前（小端字节序）。
//! 角度在总线上表示为带符号 32 位"电机步数"，
//! `steps_per_degree = motor_steps / 360`，默认 `motor_steps = 2^30`。

pub mod commands;
pub mod status;

pub use commands::CommandId;
pub use status::{FirmwareVersion, ResponseCode, StatusWord};

use thiserror::Error;

/// 广播地址（所有定位器监听）
pub const BROADCAST_ID: u16 = 0;

/// 默认电机步数（一整圈对应的步数，2^30）
pub const DEFAULT_MOTOR_STEPS: i64 = 1 << 30;

/// 轨迹时间量化步长（秒）
pub const DEFAULT_TIME_STEP: f64 = 0.0005;

/// 电机速度下限（RPM，输入端）
pub const MIN_SPEED_RPM: f64 = 0.0;

/// 电机速度上限（RPM，输入端）
pub const MAX_SPEED_RPM: f64 = 5000.0;

/// 协议编解码错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 负载长度不足
    #[error("payload too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// 未注册的命令操作码
    #[error("unknown command id {0}")]
    UnknownCommand(u8),

    /// 字段取值非法
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: i64 },
}

// ============================================================================
// 仲裁 ID 编解码
// ============================================================================

/// 解码后的仲裁 ID 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierFields {
    pub positioner_id: u16,
    pub command_id: u8,
    pub uid: u8,
    pub response_code: u8,
}

/// 29 位仲裁 ID 的字段宽度布局
///
/// 默认 11/8/6/4（合计 29 位）。宽度是配置项，
/// 编解码通过预先计算的移位/掩码完成，无分支、无堆分配。
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IdentifierLayout {
    pub positioner_bits: u8,
    pub command_bits: u8,
    pub uid_bits: u8,
    pub response_bits: u8,
}

impl Default for IdentifierLayout {
    fn default() -> Self {
        Self {
            positioner_bits: 11,
            command_bits: 8,
            uid_bits: 6,
            response_bits: 4,
        }
    }
}

impl IdentifierLayout {
    /// 字段宽度合计（必须等于 29）
    pub fn total_bits(&self) -> u8 {
        self.positioner_bits + self.command_bits + self.uid_bits + self.response_bits
    }

    /// UID 池大小（`2^uid_bits - 1`，UID 0 保留给广播）
    pub fn uid_pool_size(&self) -> u8 {
        ((1u16 << self.uid_bits) - 1) as u8
    }

    #[inline]
    fn shifts(&self) -> (u32, u32, u32) {
        let uid_shift = self.response_bits as u32;
        let cmd_shift = uid_shift + self.uid_bits as u32;
        let pos_shift = cmd_shift + self.command_bits as u32;
        (pos_shift, cmd_shift, uid_shift)
    }

    /// 组装 29 位仲裁 ID
    #[inline]
    pub fn encode(&self, positioner_id: u16, command_id: u8, uid: u8, response_code: u8) -> u32 {
        let (pos_shift, cmd_shift, uid_shift) = self.shifts();
        let pos_mask = (1u32 << self.positioner_bits) - 1;
        let cmd_mask = (1u32 << self.command_bits) - 1;
        let uid_mask = (1u32 << self.uid_bits) - 1;
        let resp_mask = (1u32 << self.response_bits) - 1;

        ((positioner_id as u32 & pos_mask) << pos_shift)
            | ((command_id as u32 & cmd_mask) << cmd_shift)
            | ((uid as u32 & uid_mask) << uid_shift)
            | (response_code as u32 & resp_mask)
    }

    /// 拆解 29 位仲裁 ID 为各字段
    #[inline]
    pub fn decode(&self, identifier: u32) -> IdentifierFields {
        let (pos_shift, cmd_shift, uid_shift) = self.shifts();
        let pos_mask = (1u32 << self.positioner_bits) - 1;
        let cmd_mask = (1u32 << self.command_bits) - 1;
        let uid_mask = (1u32 << self.uid_bits) - 1;
        let resp_mask = (1u32 << self.response_bits) - 1;

        IdentifierFields {
            positioner_id: ((identifier >> pos_shift) & pos_mask) as u16,
            command_id: ((identifier >> cmd_shift) & cmd_mask) as u8,
            uid: ((identifier >> uid_shift) & uid_mask) as u8,
            response_code: (identifier & resp_mask) as u8,
        }
    }
}

// ============================================================================
// 负载字节工具（小端）
// ============================================================================

/// 从负载中读取小端 i32
#[inline]
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32, ProtocolError> {
    let end = offset + 4;
    if data.len() < end {
        return Err(ProtocolError::TooShort {
            expected: end,
            actual: data.len(),
        });
    }
    Ok(i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

/// 从负载中读取小端 u32
#[inline]
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    read_i32_le(data, offset).map(|v| v as u32)
}

// ============================================================================
// 角度 / 步数换算
// ============================================================================

/// 电机步数转角度（度）
pub fn motor_steps_to_angle(alpha_steps: i32, beta_steps: i32, motor_steps: i64) -> (f64, f64) {
    (
        alpha_steps as f64 / motor_steps as f64 * 360.0,
        beta_steps as f64 / motor_steps as f64 * 360.0,
    )
}

/// 角度（度）转电机步数（四舍五入）
pub fn angle_to_motor_steps(alpha: f64, beta: f64, motor_steps: i64) -> (i32, i32) {
    (
        (alpha * motor_steps as f64 / 360.0).round() as i32,
        (beta * motor_steps as f64 / 360.0).round() as i32,
    )
}

/// 将速度裁剪到设备允许的 RPM 范围并取整
pub fn clip_rpm(speed: f64) -> u32 {
    speed.clamp(MIN_SPEED_RPM, MAX_SPEED_RPM).round() as u32
}

/// 估算一次 goto 移动所需的时间（秒）
///
/// `move_deg * ratio / (6 * rpm)`，再加 0.25 s 的减速余量。
/// 减速余量不精确，但对绝大多数移动是个足够好的近似。
pub fn goto_move_time(move_deg: f64, speed_rpm: f64, reduction_ratio: f64) -> f64 {
    move_deg.abs() * reduction_ratio / (6.0 * speed_rpm) + 0.25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_layout_totals_29_bits() {
        let layout = IdentifierLayout::default();
        assert_eq!(layout.total_bits(), 29);
        assert_eq!(layout.uid_pool_size(), 63);
    }

    #[test]
    fn test_identifier_encode_known_value() {
        // 与固件文档中的参考值一致：positioner 5, command 17
        let layout = IdentifierLayout::default();
        assert_eq!(layout.encode(5, 17, 0, 0), 1328128);
        assert_eq!(layout.encode(5, 17, 5, 0), 1328128 + (5 << 4));
    }

    #[test]
    fn test_identifier_round_trip() {
        let layout = IdentifierLayout::default();
        let id = layout.encode(1234, 56, 63, 9);
        let fields = layout.decode(id);
        assert_eq!(fields.positioner_id, 1234);
        assert_eq!(fields.command_id, 56);
        assert_eq!(fields.uid, 63);
        assert_eq!(fields.response_code, 9);
    }

    #[test]
    fn test_identifier_broadcast_is_zero_prefix() {
        let layout = IdentifierLayout::default();
        let id = layout.encode(BROADCAST_ID, 3, 0, 0);
        assert_eq!(layout.decode(id).positioner_id, 0);
        assert_eq!(layout.decode(id).uid, 0);
    }

    #[test]
    fn test_read_i32_le() {
        let data = [0x01, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(read_i32_le(&data, 0).unwrap(), 1);
        assert_eq!(read_i32_le(&data, 4).unwrap(), -1);
        assert!(read_i32_le(&data, 5).is_err());
    }

    #[test]
    fn test_motor_steps_round_trip() {
        let (a_steps, b_steps) = angle_to_motor_steps(90.0, -45.0, DEFAULT_MOTOR_STEPS);
        let (alpha, beta) = motor_steps_to_angle(a_steps, b_steps, DEFAULT_MOTOR_STEPS);
        assert!((alpha - 90.0).abs() < 1e-6);
        assert!((beta + 45.0).abs() < 1e-6);
    }

    #[test]
    fn test_negative_angles_are_preserved() {
        // goto 不允许把负的起始角裁剪到 [0, 360)
        let (a_steps, _) = angle_to_motor_steps(-10.0, 0.0, DEFAULT_MOTOR_STEPS);
        assert!(a_steps < 0);
        let (alpha, _) = motor_steps_to_angle(a_steps, 0, DEFAULT_MOTOR_STEPS);
        assert!((alpha + 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_rpm_bounds() {
        assert_eq!(clip_rpm(-100.0), 0);
        assert_eq!(clip_rpm(2000.4), 2000);
        assert_eq!(clip_rpm(99999.0), 5000);
    }

    #[test]
    fn test_goto_move_time_includes_deceleration() {
        let t = goto_move_time(0.0, 2000.0, 1037.0);
        assert!((t - 0.25).abs() < 1e-9);
        assert!(goto_move_time(90.0, 2000.0, 1037.0) > t);
    }
}
