//! 常用类型一站式导入
//!
//! ```
//! use fps_sdk::prelude::*;
//! ```

pub use crate::can::{BusAdapter, CanError, FpsFrame, VirtualNetwork};
pub use crate::command::{Command, CommandStatus, Reply};
pub use crate::config::FpsConfig;
pub use crate::error::{FpsError, Result};
pub use crate::events::{FpsEvent, FpsRequest, FpsResponse};
pub use crate::fps::{Fps, FpsState};
pub use crate::positioner::Positioner;
pub use crate::protocol::{CommandId, FirmwareVersion, ResponseCode, StatusWord};
pub use crate::scheduler::{CommandHandle, CommandResult};
pub use crate::trajectory::{TrajectoryData, TrajectoryError, TrajectoryFailure};
