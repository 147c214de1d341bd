//! 状态字解码表与响应码
//!
//! 定位器的 32 位状态字按固件版本有两套位定义（4.0 与 4.1+），
//! bootloader 模式另有一套更窄的定义。检查状态的代码一律通过
//! `StatusWord` 的谓词访问，不直接接触具体的位表。

use bitflags::bitflags;
use std::fmt;

// ============================================================================
// 固件版本
// ============================================================================

/// 固件版本三元组
///
/// `minor == 0x80` 表示定位器处于 bootloader 模式
/// （上电后约 10 秒的窗口，只接受固件升级类命令）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const BOOTLOADER_MINOR: u8 = 0x80;

    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// 是否处于 bootloader 模式
    pub const fn is_bootloader(&self) -> bool {
        self.minor == Self::BOOTLOADER_MINOR
    }

    /// 状态字是否使用 4.1+ 的位定义
    pub const fn uses_v4_1_flags(&self) -> bool {
        self.major > 4 || (self.major == 4 && self.minor >= 1)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}.{:02}.{:02}", self.major, self.minor, self.patch)
    }
}

// ============================================================================
// 响应码（仲裁 ID 低 4 位）
// ============================================================================

/// 回复帧携带的响应码
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    CommandAccepted = 0,
    ValueOutOfRange = 1,
    InvalidTrajectory = 2,
    AlreadyInMotion = 3,
    DatumNotInitialized = 4,
    IncorrectAmountOfData = 5,
    CalibrationModeActive = 6,
    MotorNotCalibrated = 7,
    CollisionDetected = 8,
    HallSensorDisabled = 9,
    InvalidBroadcastCommand = 10,
    InvalidBootloaderCommand = 11,
    InvalidCommand = 12,
    UnknownCommand = 13,
    DatumNotCalibrated = 14,
    HallSensorsDisabled = 15,
}

impl ResponseCode {
    /// 从 4 位字段恢复响应码（0..=15 全部有定义）
    pub fn from_u8(value: u8) -> Self {
        use ResponseCode::*;
        match value & 0x0F {
            0 => CommandAccepted,
            1 => ValueOutOfRange,
            2 => InvalidTrajectory,
            3 => AlreadyInMotion,
            4 => DatumNotInitialized,
            5 => IncorrectAmountOfData,
            6 => CalibrationModeActive,
            7 => MotorNotCalibrated,
            8 => CollisionDetected,
            9 => HallSensorDisabled,
            10 => InvalidBroadcastCommand,
            11 => InvalidBootloaderCommand,
            12 => InvalidCommand,
            13 => UnknownCommand,
            14 => DatumNotCalibrated,
            _ => HallSensorsDisabled,
        }
    }

    /// 是否为接受
    pub fn is_accepted(&self) -> bool {
        matches!(self, ResponseCode::CommandAccepted)
    }
}

// ============================================================================
// 状态位表
// ============================================================================

bitflags! {
    /// 定位器状态位（固件 >= 04.01.00）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PositionerStatusV41: u64 {
        const SYSTEM_INITIALIZED              = 0x0000_0000_0000_0001;
        const CONFIG_CHANGED                  = 0x0000_0000_0000_0002;
        const BSETTINGS_CHANGED               = 0x0000_0000_0000_0004;
        const DATA_STREAMING                  = 0x0000_0000_0000_0008;
        const RECEIVING_TRAJECTORY            = 0x0000_0000_0000_0010;
        const TRAJECTORY_ALPHA_RECEIVED       = 0x0000_0000_0000_0020;
        const TRAJECTORY_BETA_RECEIVED        = 0x0000_0000_0000_0040;
        const LOW_POWER_AFTER_MOVE            = 0x0000_0000_0000_0080;
        const DISPLACEMENT_COMPLETED          = 0x0000_0000_0000_0100;
        const DISPLACEMENT_COMPLETED_ALPHA    = 0x0000_0000_0000_0200;
        const DISPLACEMENT_COMPLETED_BETA     = 0x0000_0000_0000_0400;
        const COLLISION_ALPHA                 = 0x0000_0000_0000_0800;
        const COLLISION_BETA                  = 0x0000_0000_0000_1000;
        const CLOSED_LOOP_ALPHA               = 0x0000_0000_0000_2000;
        const CLOSED_LOOP_BETA                = 0x0000_0000_0000_4000;
        const PRECISE_POSITIONING_ALPHA       = 0x0000_0000_0000_8000;
        const PRECISE_POSITIONING_BETA        = 0x0000_0000_0001_0000;
        const COLLISION_DETECT_ALPHA_DISABLE  = 0x0000_0000_0002_0000;
        const COLLISION_DETECT_BETA_DISABLE   = 0x0000_0000_0004_0000;
        const MOTOR_CALIBRATION               = 0x0000_0000_0008_0000;
        const MOTOR_ALPHA_CALIBRATED          = 0x0000_0000_0010_0000;
        const MOTOR_BETA_CALIBRATED           = 0x0000_0000_0020_0000;
        const DATUM_CALIBRATION               = 0x0000_0000_0040_0000;
        const DATUM_ALPHA_CALIBRATED          = 0x0000_0000_0080_0000;
        const DATUM_BETA_CALIBRATED           = 0x0000_0000_0100_0000;
        const DATUM_INITIALIZATION            = 0x0000_0000_0200_0000;
        const DATUM_ALPHA_INITIALIZED         = 0x0000_0000_0400_0000;
        const DATUM_BETA_INITIALIZED          = 0x0000_0000_0800_0000;
        const HALL_ALPHA_DISABLE              = 0x0000_0000_1000_0000;
        const HALL_BETA_DISABLE               = 0x0000_0000_2000_0000;
        const COGGING_CALIBRATION             = 0x0000_0000_4000_0000;
        const COGGING_ALPHA_CALIBRATED        = 0x0000_0000_8000_0000;
        const COGGING_BETA_CALIBRATED         = 0x0000_0001_0000_0000;
        const ESTIMATED_POSITION              = 0x0000_0002_0000_0000;
        const POSITION_RESTORED               = 0x0000_0004_0000_0000;
        const SWITCH_OFF_AFTER_MOVE           = 0x0000_0008_0000_0000;
        const CALIBRATION_SAVED               = 0x0000_0010_0000_0000;
        const PRECISE_MOVE_IN_OPEN_LOOP_ALPHA = 0x0000_0020_0000_0000;
        const PRECISE_MOVE_IN_OPEN_LOOP_BETA  = 0x0000_0040_0000_0000;
        const SWITCH_OFF_HALL_AFTER_MOVE      = 0x0000_0080_0000_0000;
        const UNKNOWN                         = 0x0000_0100_0000_0000;
    }
}

bitflags! {
    /// 定位器状态位（固件 <= 04.00.04）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PositionerStatusV40: u64 {
        const SYSTEM_INITIALIZATION           = 0x0000_0001;
        const RECEIVING_TRAJECTORY            = 0x0000_0100;
        const TRAJECTORY_ALPHA_RECEIVED       = 0x0000_0200;
        const TRAJECTORY_BETA_RECEIVED        = 0x0000_0400;
        const DATUM_INITIALIZATION            = 0x0020_0000;
        const DATUM_ALPHA_INITIALIZED         = 0x0040_0000;
        const DATUM_BETA_INITIALIZED          = 0x0080_0000;
        const DISPLACEMENT_COMPLETED          = 0x0100_0000;
        const ALPHA_DISPLACEMENT_COMPLETED    = 0x0200_0000;
        const BETA_DISPLACEMENT_COMPLETED     = 0x0400_0000;
        const ALPHA_COLLISION                 = 0x0800_0000;
        const BETA_COLLISION                  = 0x1000_0000;
        const DATUM_INITIALIZED               = 0x2000_0000;
        const ESTIMATED_POSITION              = 0x4000_0000;
        const POSITION_RESTORED               = 0x8000_0000;
        const UNKNOWN                         = 0x1_0000_0000;
    }
}

bitflags! {
    /// bootloader 模式下的状态位（定义更窄）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BootloaderStatus: u32 {
        const BOOTLOADER_INIT        = 0x0000_0001;
        const BOOTLOADER_TIMEOUT     = 0x0000_0002;
        const BSETTINGS_CHANGED      = 0x0000_0200;
        const RECEIVING_NEW_FIRMWARE = 0x0001_0000;
        const NEW_FIRMWARE_RECEIVED  = 0x0100_0000;
        const NEW_FIRMWARE_CHECK_OK  = 0x0200_0000;
        const NEW_FIRMWARE_CHECK_BAD = 0x0400_0000;
        const UNKNOWN                = 0x4000_0000;
    }
}

// ============================================================================
// 带标签的状态字
// ============================================================================

/// 按固件版本打标签的状态字
///
/// 解码表随固件版本不同而不同，所有消费方只通过这里的谓词判断状态，
/// 谓词在各版本间给出一致的语义。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusWord {
    /// 尚未读到任何状态
    #[default]
    Unknown,
    V40(PositionerStatusV40),
    V41(PositionerStatusV41),
    Bootloader(BootloaderStatus),
}

impl StatusWord {
    /// 按固件版本选择解码表
    ///
    /// 固件版本未知时按 4.1+ 解释（当前机群的主流固件）。
    pub fn from_raw(raw: u32, firmware: Option<FirmwareVersion>) -> Self {
        match firmware {
            Some(fw) if fw.is_bootloader() => {
                StatusWord::Bootloader(BootloaderStatus::from_bits_truncate(raw))
            }
            Some(fw) if !fw.uses_v4_1_flags() => {
                StatusWord::V40(PositionerStatusV40::from_bits_truncate(raw as u64))
            }
            _ => StatusWord::V41(PositionerStatusV41::from_bits_truncate(raw as u64)),
        }
    }

    /// 原始 32 位状态字
    pub fn raw(&self) -> u32 {
        match self {
            StatusWord::Unknown => 0,
            StatusWord::V40(s) => s.bits() as u32,
            StatusWord::V41(s) => s.bits() as u32,
            StatusWord::Bootloader(s) => s.bits(),
        }
    }

    /// 系统是否完成初始化
    pub fn is_initialised(&self) -> bool {
        match self {
            StatusWord::Unknown => false,
            StatusWord::V40(s) => s.contains(PositionerStatusV40::SYSTEM_INITIALIZATION),
            StatusWord::V41(s) => s.contains(PositionerStatusV41::SYSTEM_INITIALIZED),
            StatusWord::Bootloader(s) => s.contains(BootloaderStatus::BOOTLOADER_INIT),
        }
    }

    /// 两轴基准是否都已初始化
    pub fn is_datum_initialised(&self) -> bool {
        match self {
            StatusWord::V40(s) => s.contains(
                PositionerStatusV40::DATUM_ALPHA_INITIALIZED
                    | PositionerStatusV40::DATUM_BETA_INITIALIZED,
            ),
            StatusWord::V41(s) => s.contains(
                PositionerStatusV41::DATUM_ALPHA_INITIALIZED
                    | PositionerStatusV41::DATUM_BETA_INITIALIZED,
            ),
            _ => false,
        }
    }

    /// 位移是否已完成（未在运动中）
    pub fn has_displacement_completed(&self) -> bool {
        match self {
            StatusWord::V40(s) => s.contains(PositionerStatusV40::DISPLACEMENT_COMPLETED),
            StatusWord::V41(s) => s.contains(PositionerStatusV41::DISPLACEMENT_COMPLETED),
            // bootloader 不会运动
            StatusWord::Bootloader(_) => true,
            StatusWord::Unknown => false,
        }
    }

    /// 任一轴是否报告碰撞
    pub fn is_collided(&self) -> bool {
        match self {
            StatusWord::V40(s) => s.intersects(
                PositionerStatusV40::ALPHA_COLLISION | PositionerStatusV40::BETA_COLLISION,
            ),
            StatusWord::V41(s) => s.intersects(
                PositionerStatusV41::COLLISION_ALPHA | PositionerStatusV41::COLLISION_BETA,
            ),
            _ => false,
        }
    }

    /// 是否为 bootloader 状态字
    pub fn is_bootloader(&self) -> bool {
        matches!(self, StatusWord::Bootloader(_))
    }

    /// 是否正在接收轨迹数据
    pub fn is_receiving_trajectory(&self) -> bool {
        match self {
            StatusWord::V40(s) => s.contains(PositionerStatusV40::RECEIVING_TRAJECTORY),
            StatusWord::V41(s) => s.contains(PositionerStatusV41::RECEIVING_TRAJECTORY),
            _ => false,
        }
    }

    /// 碰撞检测是否被禁用（仅 4.1+ 固件可判断）
    pub fn collision_detection_disabled(&self) -> bool {
        match self {
            StatusWord::V41(s) => s.intersects(
                PositionerStatusV41::COLLISION_DETECT_ALPHA_DISABLE
                    | PositionerStatusV41::COLLISION_DETECT_BETA_DISABLE,
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FW_V4_1: FirmwareVersion = FirmwareVersion::new(4, 1, 0);
    const FW_V4_0: FirmwareVersion = FirmwareVersion::new(4, 0, 4);
    const FW_BOOT: FirmwareVersion = FirmwareVersion::new(4, 0x80, 0);

    #[test]
    fn test_firmware_display_zero_padded() {
        assert_eq!(FW_V4_1.to_string(), "04.01.00");
        assert_eq!(FW_BOOT.to_string(), "04.128.00");
    }

    #[test]
    fn test_bootloader_detection() {
        assert!(!FW_V4_1.is_bootloader());
        assert!(FW_BOOT.is_bootloader());
    }

    #[test]
    fn test_flag_table_selection() {
        assert!(matches!(
            StatusWord::from_raw(1, Some(FW_V4_1)),
            StatusWord::V41(_)
        ));
        assert!(matches!(
            StatusWord::from_raw(1, Some(FW_V4_0)),
            StatusWord::V40(_)
        ));
        assert!(matches!(
            StatusWord::from_raw(1, Some(FW_BOOT)),
            StatusWord::Bootloader(_)
        ));
        // 固件未知时默认 4.1+
        assert!(matches!(StatusWord::from_raw(1, None), StatusWord::V41(_)));
    }

    #[test]
    fn test_collision_predicate_across_versions() {
        let v41 = StatusWord::from_raw(
            PositionerStatusV41::COLLISION_BETA.bits() as u32,
            Some(FW_V4_1),
        );
        assert!(v41.is_collided());

        let v40 = StatusWord::from_raw(
            PositionerStatusV40::ALPHA_COLLISION.bits() as u32,
            Some(FW_V4_0),
        );
        assert!(v40.is_collided());

        assert!(!StatusWord::from_raw(0, Some(FW_V4_1)).is_collided());
    }

    #[test]
    fn test_displacement_predicate() {
        let moving = StatusWord::from_raw(
            PositionerStatusV41::SYSTEM_INITIALIZED.bits() as u32,
            Some(FW_V4_1),
        );
        assert!(!moving.has_displacement_completed());

        let idle = StatusWord::from_raw(
            (PositionerStatusV41::SYSTEM_INITIALIZED | PositionerStatusV41::DISPLACEMENT_COMPLETED)
                .bits() as u32,
            Some(FW_V4_1),
        );
        assert!(idle.has_displacement_completed());

        // bootloader 视为不运动
        assert!(StatusWord::from_raw(1, Some(FW_BOOT)).has_displacement_completed());
    }

    #[test]
    fn test_datum_requires_both_axes() {
        let alpha_only = StatusWord::from_raw(
            PositionerStatusV41::DATUM_ALPHA_INITIALIZED.bits() as u32,
            Some(FW_V4_1),
        );
        assert!(!alpha_only.is_datum_initialised());

        let both = StatusWord::from_raw(
            (PositionerStatusV41::DATUM_ALPHA_INITIALIZED
                | PositionerStatusV41::DATUM_BETA_INITIALIZED)
                .bits() as u32,
            Some(FW_V4_1),
        );
        assert!(both.is_datum_initialised());
    }

    #[test]
    fn test_response_code_covers_all_nibbles() {
        for value in 0..16u8 {
            let code = ResponseCode::from_u8(value);
            assert_eq!(code as u8, value);
        }
        assert!(ResponseCode::from_u8(0).is_accepted());
        assert!(!ResponseCode::from_u8(13).is_accepted());
    }
}
