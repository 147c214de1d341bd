//! SDK 错误类型定义

use thiserror::Error;

use crate::can::CanError;
use crate::protocol::commands::CommandId;
use crate::protocol::status::ResponseCode;
use crate::protocol::ProtocolError;
use crate::trajectory::TrajectoryError;

/// SDK 顶层错误类型
#[derive(Error, Debug)]
pub enum FpsError {
    /// CAN 传输层错误（接口断开、写失败、帧损坏）
    #[error("CAN transport error: {0}")]
    Can(#[from] CanError),

    /// 协议编解码错误
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 定位器以非接受响应码回复
    #[error("command {command:?} rejected with {code:?}")]
    Command {
        command: CommandId,
        code: ResponseCode,
    },

    /// 命令超时未收到回复
    #[error("command {0:?} timed out")]
    Timeout(CommandId),

    /// 命令被取消
    #[error("command {0:?} was cancelled")]
    Cancelled(CommandId),

    /// 轨迹失败（含逐定位器的失败原因表）
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    /// FPS 处于锁定状态，非安全命令被同步拒绝
    #[error("the FPS is locked by positioners {0:?}")]
    Locked(Vec<u16>),

    /// 命令指向了被禁用的定位器
    #[error("positioner {0} is disabled")]
    PositionerDisabled(u16),

    /// 命令指向了未连接的定位器
    #[error("positioner {0} is not connected")]
    UnknownPositioner(u16),

    /// 定位器处于 bootloader 模式，命令不可用
    #[error("positioner {0} is in bootloader mode")]
    Bootloader(u16),

    /// 移动或轨迹会违反配置的安全界限
    #[error("safe mode violation: {0}")]
    SafeModeViolation(String),

    /// 机群正在运动，拒绝新的运动命令
    #[error("the FPS is moving; stop the trajectory first")]
    Moving,

    /// 单实例锁已被其他进程持有
    #[error("another instance is already operating this FPS")]
    AlreadyRunning,

    /// 配置合并后不可用
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `(command_id, positioner_id)` 的 UID 池耗尽
    ///
    /// 互斥规则下不应发生；出现即为逻辑错误。
    #[error("no UIDs left in the pool for ({command:?}, {positioner_id})")]
    EmptyPool {
        command: CommandId,
        positioner_id: u16,
    },

    /// 命令不允许广播
    #[error("command {0:?} cannot be broadcast")]
    NotBroadcastable(CommandId),

    /// 广播不能与具体定位器混在同一命令里
    #[error("broadcasts cannot be mixed with other positioners")]
    MixedBroadcast,

    /// FPS 尚未完成初始化
    #[error("the FPS is not initialised")]
    NotInitialised,

    /// 调度器已关闭
    #[error("the scheduler has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, FpsError>;
