//! # FPS SDK
//!
//! 焦平面系统（FPS）光纤定位器机群的 CAN 控制 SDK。
//!
//! 一个 FPS 由至多约 500 台两轴（alpha/beta）机器人定位器组成，
//! 挂在多通道、多总线的 CAN 网络上。本 crate 实现其命令 / 轨迹引擎：
//!
//! - **帧与回复匹配**：29 位仲裁 ID 装载
//!   `(positioner_id, command_id, uid, response_code)`，按 UID 匹配回复
//! - **多接口调度**：`(command_id, positioner_id)` 互斥、广播串行化、
//!   按发现路由扇出，发送绝不阻塞接收
//! - **轨迹执行**：分块上传、广播启动、状态监视、失败回收，
//!   全程不留半上传的轨迹
//! - **机群安全**：碰撞即锁定，锁定期间只放行安全命令，
//!   禁用 / 离线定位器被排除在非安全命令之外
//!
//! # 架构层次
//!
//! - 低层（`can`, `protocol`）：总线适配与协议编解码，无业务语义
//! - 调度层（`command`, `scheduler`）：命令状态机与并发协调
//! - 机群层（`positioner`, `fps`, `trajectory`, `events`）：协调器与操作面
//!
//! # 快速上手
//!
//! ```no_run
//! use std::collections::HashMap;
//! use fps_sdk::{Fps, FpsConfig};
//!
//! # fn main() -> Result<(), fps_sdk::FpsError> {
//! let config = FpsConfig::load(None, None)?;
//! let fps = Fps::new(config)?;
//! fps.initialise()?;
//!
//! // 把 4 号定位器送到 (90°, 45°)
//! let mut targets = HashMap::new();
//! targets.insert(4u16, (90.0, 45.0));
//! fps.goto(targets, None)?;
//!
//! fps.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod can;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod fps;
pub mod positioner;
pub mod prelude;
pub mod protocol;
pub mod scheduler;
pub mod singleton;
pub mod trajectory;

pub use can::{BusAdapter, CanError, FpsFrame};
pub use command::{Command, CommandStatus, Reply};
pub use config::FpsConfig;
pub use error::FpsError;
pub use events::{FpsEvent, FpsRequest, FpsResponse};
pub use fps::{Fps, FpsState};
pub use positioner::Positioner;
pub use protocol::{CommandId, FirmwareVersion, ResponseCode, StatusWord};
pub use scheduler::{CommandHandle, CommandResult};
pub use trajectory::{TrajectoryData, TrajectoryError, TrajectoryFailure};
