//! 固件命令操作码与命令注册表
//!
//! 每个操作码对应一个静态的 `CommandSpec`，描述该命令的名称、
//! 默认超时、安全属性（锁定状态下是否允许）、是否可广播、
//! bootloader 模式下是否可用、是否产生运动。
//! 命令到帧的转换是查表驱动的，没有多态的消息类层次。
//!
//! 收到注册表之外的操作码时只记录日志并丢弃，绝不使任何命令失败。

use std::time::Duration;

use super::{
    angle_to_motor_steps, clip_rpm, motor_steps_to_angle, read_i32_le, read_u32_le,
    status::FirmwareVersion, ProtocolError,
};

// ============================================================================
// 操作码
// ============================================================================

/// 固件命令操作码
///
/// 数值与定位器固件约定一致，按功能分组：
/// 发现、轨迹/运动、标定、配置、固件升级。
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandId {
    // --- 发现 ---
    GetId = 1,
    GetFirmwareVersion = 2,
    GetStatus = 3,

    // --- 轨迹 ---
    SendNewTrajectory = 10,
    SendTrajectoryData = 11,
    TrajectoryDataEnd = 12,
    SendTrajectoryAbort = 13,
    StartTrajectory = 14,
    StopTrajectory = 15,

    /// 固件主动上报的碰撞通知（不是主机发起的命令）
    CollisionDetected = 18,

    // --- 运动 ---
    GoToDatums = 20,
    GoToDatumAlpha = 21,
    GoToDatumBeta = 22,

    // --- 标定 ---
    StartDatumCalibration = 23,
    StartMotorCalibration = 26,
    StartCoggingCalibration = 47,
    SaveInternalCalibration = 53,

    // --- 位置 ---
    GoToAbsolutePosition = 30,
    GoToRelativePosition = 31,
    GetActualPosition = 32,
    SetActualPosition = 33,

    // --- 配置 ---
    SetSpeed = 40,
    SetCurrent = 41,
    HallOn = 116,
    HallOff = 117,
    AlphaClosedLoopCollisionDetection = 118,
    AlphaClosedLoopWithoutCollisionDetection = 119,
    AlphaOpenLoopCollisionDetection = 120,
    AlphaOpenLoopWithoutCollisionDetection = 121,
    BetaClosedLoopCollisionDetection = 122,
    BetaClosedLoopWithoutCollisionDetection = 123,
    BetaOpenLoopCollisionDetection = 124,
    BetaOpenLoopWithoutCollisionDetection = 125,
    SwitchLedOn = 126,
    SwitchLedOff = 127,
    SwitchOnPreciseMoveAlpha = 128,
    SwitchOffPreciseMoveAlpha = 129,
    SwitchOnPreciseMoveBeta = 130,
    SwitchOffPreciseMoveBeta = 131,
    GetNumberTrajectories = 139,

    // --- 固件升级 ---
    StartFirmwareUpgrade = 200,
    SendFirmwareData = 201,
}

impl CommandId {
    /// 从线上的 8 位操作码恢复 `CommandId`
    ///
    /// 未注册的操作码返回 `None`，调用方记录日志后丢弃该帧。
    pub fn from_u8(value: u8) -> Option<Self> {
        use CommandId::*;
        Some(match value {
            1 => GetId,
            2 => GetFirmwareVersion,
            3 => GetStatus,
            10 => SendNewTrajectory,
            11 => SendTrajectoryData,
            12 => TrajectoryDataEnd,
            13 => SendTrajectoryAbort,
            14 => StartTrajectory,
            15 => StopTrajectory,
            18 => CollisionDetected,
            20 => GoToDatums,
            21 => GoToDatumAlpha,
            22 => GoToDatumBeta,
            23 => StartDatumCalibration,
            26 => StartMotorCalibration,
            47 => StartCoggingCalibration,
            53 => SaveInternalCalibration,
            30 => GoToAbsolutePosition,
            31 => GoToRelativePosition,
            32 => GetActualPosition,
            33 => SetActualPosition,
            40 => SetSpeed,
            41 => SetCurrent,
            116 => HallOn,
            117 => HallOff,
            118 => AlphaClosedLoopCollisionDetection,
            119 => AlphaClosedLoopWithoutCollisionDetection,
            120 => AlphaOpenLoopCollisionDetection,
            121 => AlphaOpenLoopWithoutCollisionDetection,
            122 => BetaClosedLoopCollisionDetection,
            123 => BetaClosedLoopWithoutCollisionDetection,
            124 => BetaOpenLoopCollisionDetection,
            125 => BetaOpenLoopWithoutCollisionDetection,
            126 => SwitchLedOn,
            127 => SwitchLedOff,
            128 => SwitchOnPreciseMoveAlpha,
            129 => SwitchOffPreciseMoveAlpha,
            130 => SwitchOnPreciseMoveBeta,
            131 => SwitchOffPreciseMoveBeta,
            139 => GetNumberTrajectories,
            200 => StartFirmwareUpgrade,
            201 => SendFirmwareData,
            _ => return None,
        })
    }

    /// 查询该操作码的注册表条目
    pub const fn spec(self) -> CommandSpec {
        use CommandId::*;
        match self {
            GetId => CommandSpec::new("GET_ID")
                .safe()
                .broadcastable()
                .bootloader()
                .timeout_ms(1000),
            GetFirmwareVersion => CommandSpec::new("GET_FIRMWARE_VERSION")
                .safe()
                .broadcastable()
                .bootloader()
                .timeout_ms(2000),
            GetStatus => CommandSpec::new("GET_STATUS")
                .safe()
                .broadcastable()
                .bootloader()
                .timeout_ms(2000),

            SendNewTrajectory => CommandSpec::new("SEND_NEW_TRAJECTORY").move_command(),
            SendTrajectoryData => CommandSpec::new("SEND_TRAJECTORY_DATA").move_command(),
            TrajectoryDataEnd => CommandSpec::new("TRAJECTORY_DATA_END").move_command(),
            // abort 保留碰撞标志位，锁定状态下也必须允许发送
            SendTrajectoryAbort => CommandSpec::new("SEND_TRAJECTORY_ABORT")
                .safe()
                .broadcastable(),
            StartTrajectory => CommandSpec::new("START_TRAJECTORY")
                .safe()
                .broadcastable()
                .move_command()
                .timeout_ms(1000),
            // stop 会清掉碰撞标志位，只能由操作员显式触发
            StopTrajectory => CommandSpec::new("STOP_TRAJECTORY").safe().broadcastable(),

            CollisionDetected => CommandSpec::new("COLLISION_DETECTED").safe(),

            GoToDatums => CommandSpec::new("GO_TO_DATUMS").move_command(),
            GoToDatumAlpha => CommandSpec::new("GO_TO_DATUM_ALPHA").move_command(),
            GoToDatumBeta => CommandSpec::new("GO_TO_DATUM_BETA").move_command(),

            StartDatumCalibration => CommandSpec::new("START_DATUM_CALIBRATION").move_command(),
            StartMotorCalibration => CommandSpec::new("START_MOTOR_CALIBRATION").move_command(),
            StartCoggingCalibration => {
                CommandSpec::new("START_COGGING_CALIBRATION").move_command()
            }
            SaveInternalCalibration => CommandSpec::new("SAVE_INTERNAL_CALIBRATION"),

            GoToAbsolutePosition => CommandSpec::new("GO_TO_ABSOLUTE_POSITION").move_command(),
            GoToRelativePosition => CommandSpec::new("GO_TO_RELATIVE_POSITION").move_command(),
            GetActualPosition => CommandSpec::new("GET_ACTUAL_POSITION").safe().timeout_ms(1000),
            // 技术上不产生运动，但移动过程中绝不允许改写
            SetActualPosition => CommandSpec::new("SET_ACTUAL_POSITION").safe().move_command(),

            SetSpeed => CommandSpec::new("SET_SPEED").safe(),
            SetCurrent => CommandSpec::new("SET_CURRENT").safe().move_command(),
            HallOn => CommandSpec::new("HALL_ON"),
            HallOff => CommandSpec::new("HALL_OFF"),
            AlphaClosedLoopCollisionDetection => {
                CommandSpec::new("ALPHA_CLOSED_LOOP_COLLISION_DETECTION")
            }
            AlphaClosedLoopWithoutCollisionDetection => {
                CommandSpec::new("ALPHA_CLOSED_LOOP_WITHOUT_COLLISION_DETECTION")
            }
            AlphaOpenLoopCollisionDetection => {
                CommandSpec::new("ALPHA_OPEN_LOOP_COLLISION_DETECTION")
            }
            AlphaOpenLoopWithoutCollisionDetection => {
                CommandSpec::new("ALPHA_OPEN_LOOP_WITHOUT_COLLISION_DETECTION")
            }
            BetaClosedLoopCollisionDetection => {
                CommandSpec::new("BETA_CLOSED_LOOP_COLLISION_DETECTION")
            }
            BetaClosedLoopWithoutCollisionDetection => {
                CommandSpec::new("BETA_CLOSED_LOOP_WITHOUT_COLLISION_DETECTION")
            }
            BetaOpenLoopCollisionDetection => {
                CommandSpec::new("BETA_OPEN_LOOP_COLLISION_DETECTION")
            }
            BetaOpenLoopWithoutCollisionDetection => {
                CommandSpec::new("BETA_OPEN_LOOP_WITHOUT_COLLISION_DETECTION")
            }
            SwitchLedOn => CommandSpec::new("SWITCH_LED_ON").safe(),
            SwitchLedOff => CommandSpec::new("SWITCH_LED_OFF").safe(),
            SwitchOnPreciseMoveAlpha => CommandSpec::new("SWITCH_ON_PRECISE_MOVE_ALPHA"),
            SwitchOffPreciseMoveAlpha => CommandSpec::new("SWITCH_OFF_PRECISE_MOVE_ALPHA"),
            SwitchOnPreciseMoveBeta => CommandSpec::new("SWITCH_ON_PRECISE_MOVE_BETA"),
            SwitchOffPreciseMoveBeta => CommandSpec::new("SWITCH_OFF_PRECISE_MOVE_BETA"),
            GetNumberTrajectories => {
                CommandSpec::new("GET_NUMBER_TRAJECTORIES").safe().timeout_ms(1000)
            }

            StartFirmwareUpgrade => CommandSpec::new("START_FIRMWARE_UPGRADE").bootloader(),
            SendFirmwareData => {
                CommandSpec::new("SEND_FIRMWARE_DATA").bootloader().timeout_ms(15000)
            }
        }
    }

    /// 命令的可读名称（与固件文档一致的大写下划线形式）
    pub const fn name(self) -> &'static str {
        self.spec().name
    }
}

// ============================================================================
// 注册表条目
// ============================================================================

/// 命令注册表条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// 可读名称
    pub name: &'static str,
    /// 锁定状态下是否允许调度
    pub safe: bool,
    /// 是否可以广播（positioner_id = 0）
    pub broadcastable: bool,
    /// bootloader 模式下是否可用
    pub bootloader: bool,
    /// 是否产生定位器运动
    pub move_command: bool,
    /// 默认超时（毫秒）
    pub default_timeout_ms: u64,
}

impl CommandSpec {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            safe: false,
            broadcastable: false,
            bootloader: false,
            move_command: false,
            default_timeout_ms: 5000,
        }
    }

    const fn safe(mut self) -> Self {
        self.safe = true;
        self
    }

    const fn broadcastable(mut self) -> Self {
        self.broadcastable = true;
        self
    }

    const fn bootloader(mut self) -> Self {
        self.bootloader = true;
        self
    }

    const fn move_command(mut self) -> Self {
        self.move_command = true;
        self
    }

    const fn timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    /// 默认超时
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// ============================================================================
// 负载编解码（查表驱动，帧是普通值记录）
// ============================================================================

/// 解码 `GET_FIRMWARE_VERSION` 回复
///
/// 线上字节序为 `[patch, minor, major]`。
pub fn decode_firmware(data: &[u8]) -> Result<FirmwareVersion, ProtocolError> {
    if data.len() < 3 {
        return Err(ProtocolError::TooShort {
            expected: 3,
            actual: data.len(),
        });
    }
    Ok(FirmwareVersion::new(data[2], data[1], data[0]))
}

/// 编码固件版本（测试与虚拟总线使用）
pub fn encode_firmware(version: FirmwareVersion) -> [u8; 3] {
    [version.patch, version.minor, version.major]
}

/// 解码 `GET_STATUS` 回复中的 32 位状态字
pub fn decode_status(data: &[u8]) -> Result<u32, ProtocolError> {
    read_u32_le(data, 0)
}

/// 编码状态字（测试与虚拟总线使用）
pub fn encode_status(status: u32) -> [u8; 4] {
    status.to_le_bytes()
}

/// 解码 `GET_ACTUAL_POSITION` 回复为 `(alpha, beta)` 角度（度）
pub fn decode_position(data: &[u8], motor_steps: i64) -> Result<(f64, f64), ProtocolError> {
    let alpha_steps = read_i32_le(data, 0)?;
    let beta_steps = read_i32_le(data, 4)?;
    Ok(motor_steps_to_angle(alpha_steps, beta_steps, motor_steps))
}

/// 编码 `(alpha, beta)` 角度为 8 字节步数负载
///
/// `GO_TO_ABSOLUTE_POSITION` / `SET_ACTUAL_POSITION` 与位置回复共用此格式。
pub fn encode_position(alpha: f64, beta: f64, motor_steps: i64) -> [u8; 8] {
    let (alpha_steps, beta_steps) = angle_to_motor_steps(alpha, beta, motor_steps);
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&alpha_steps.to_le_bytes());
    data[4..8].copy_from_slice(&beta_steps.to_le_bytes());
    data
}

/// 编码 `SET_SPEED` 负载（两轴 RPM，裁剪到设备范围）
pub fn encode_speed(alpha_rpm: f64, beta_rpm: f64) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&clip_rpm(alpha_rpm).to_le_bytes());
    data[4..8].copy_from_slice(&clip_rpm(beta_rpm).to_le_bytes());
    data
}

/// 编码 `SEND_NEW_TRAJECTORY` 负载（两轴样本数）
pub fn encode_new_trajectory(n_alpha: u32, n_beta: u32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&n_alpha.to_le_bytes());
    data[4..8].copy_from_slice(&n_beta.to_le_bytes());
    data
}

/// 编码一个轨迹样本点 `(angle_deg, time_s)`
///
/// 角度量化为电机步数，时间量化为 `time_step` 的整数倍。
pub fn encode_trajectory_point(
    angle_deg: f64,
    time_s: f64,
    motor_steps: i64,
    time_step: f64,
) -> [u8; 8] {
    let steps = (angle_deg / 360.0 * motor_steps as f64) as i32;
    let ticks = (time_s / time_step) as i32;
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&steps.to_le_bytes());
    data[4..8].copy_from_slice(&ticks.to_le_bytes());
    data
}

/// 解码 `GO_TO_ABSOLUTE_POSITION` 回复中的两轴移动时间（秒）
pub fn decode_move_time(data: &[u8], time_step: f64) -> Result<(f64, f64), ProtocolError> {
    let alpha_ticks = read_i32_le(data, 0)?;
    let beta_ticks = read_i32_le(data, 4)?;
    Ok((alpha_ticks as f64 * time_step, beta_ticks as f64 * time_step))
}

/// 解码 `GET_NUMBER_TRAJECTORIES` 回复
pub fn decode_number_trajectories(data: &[u8]) -> Result<u32, ProtocolError> {
    read_u32_le(data, 0)
}
