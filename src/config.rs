//! 分层配置
//!
//! 三层合并：内置默认值 ← 系统配置文件 ← 用户配置文件（JSON），
//! 按键逐层覆盖，用户层优先。合并结果不可用时报
//! `InvalidConfiguration`，启动随即中止。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FpsError, Result};
use crate::protocol::{IdentifierLayout, DEFAULT_MOTOR_STEPS, DEFAULT_TIME_STEP};

/// CAN 接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// CAN@net 多总线 TCP 设备
    Cannet,
    /// 串口 SLCAN
    Slcan,
    /// Linux SocketCAN
    Socketcan,
    /// 进程内虚拟总线（测试）
    Virtual,
}

/// CAN 接口档案
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanProfile {
    pub interface: InterfaceKind,
    /// 通道表：cannet 为主机地址，slcan 为串口路径，socketcan 为接口名
    pub channels: Vec<String>,
    /// cannet 的 TCP 端口
    pub port: u16,
    /// CAN 位速率
    pub bitrate: u32,
    /// cannet 设备上打开的子总线编号
    pub buses: Vec<usize>,
    /// slcan 的串口波特率
    pub serial_baud: u32,
}

impl Default for CanProfile {
    fn default() -> Self {
        Self {
            interface: InterfaceKind::Virtual,
            channels: Vec::new(),
            port: crate::can::cannet::DEFAULT_PORT,
            bitrate: 1_000_000,
            buses: vec![1],
            serial_baud: 115_200,
        }
    }
}

/// 轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// 状态轮询间隔（秒）
    pub status_interval_s: f64,
    /// 位置轮询间隔（秒）
    pub position_interval_s: f64,
    /// 初始化后是否自动启动轮询
    pub start_pollers: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            status_interval_s: 5.0,
            position_interval_s: 5.0,
            start_pollers: true,
        }
    }
}

/// 定位器 / 协议参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    /// 一整圈的电机步数
    pub motor_steps: i64,
    /// 轨迹时间量化步长（秒）
    pub time_step: f64,
    /// 默认电机速度（RPM，输入端）
    pub motor_speed: f64,
    /// 减速比（用于 goto 时间估算）
    pub reduction_ratio: f64,
    /// 每条轨迹数据消息的样本点数
    pub trajectory_chunk: usize,
    /// 发现阶段广播的超时（秒）
    pub initialise_timeout_s: f64,
    /// "到达目标"判定容差（度）
    pub position_tolerance: f64,
    /// 轨迹监视的状态刷新间隔（秒）
    pub trajectory_poll_s: f64,
    /// 仲裁 ID 字段宽度
    pub identifier: IdentifierLayout,
    /// 两轴角度上限（度）
    pub alpha_range: (f64, f64),
    pub beta_range: (f64, f64),
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            motor_steps: DEFAULT_MOTOR_STEPS,
            time_step: DEFAULT_TIME_STEP,
            motor_speed: 2000.0,
            reduction_ratio: 1037.0,
            trajectory_chunk: 3,
            initialise_timeout_s: 0.5,
            position_tolerance: 0.1,
            trajectory_poll_s: 1.0,
            identifier: IdentifierLayout::default(),
            alpha_range: (-10.0, 370.0),
            beta_range: (-10.0, 370.0),
        }
    }
}

/// 安全模式：限制 beta 轴最小角
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeModeConfig {
    pub enabled: bool,
    pub min_beta: f64,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_beta: 160.0,
        }
    }
}

/// FPS 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FpsConfig {
    pub profile: CanProfile,
    pub poller: PollerConfig,
    pub positioner: PositionerConfig,
    pub safe_mode: SafeModeConfig,
    /// 单实例锁文件路径；`None` 时不加锁（测试）
    pub lockfile: Option<PathBuf>,
    /// 轨迹诊断转储目录；`None` 时不落盘
    pub trajectory_dump_path: Option<PathBuf>,
    /// 配置禁用的定位器
    pub disabled_positioners: Vec<u16>,
    /// 离线定位器及其已知位置（物理在阵但不回复）
    pub offline_positioners: HashMap<u16, (f64, f64)>,
}

impl FpsConfig {
    /// 加载分层配置：默认值 ← 系统文件 ← 用户文件
    ///
    /// 路径为 `None` 或文件不存在的层被跳过。
    pub fn load(system: Option<&Path>, user: Option<&Path>) -> Result<Self> {
        let mut merged = serde_json::to_value(FpsConfig::default())
            .map_err(|e| FpsError::InvalidConfiguration(e.to_string()))?;

        for path in [system, user].into_iter().flatten() {
            if !path.exists() {
                debug!(path = %path.display(), "config layer not present, skipping");
                continue;
            }
            let text = std::fs::read_to_string(path).map_err(|e| {
                FpsError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
            })?;
            let layer: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                FpsError::InvalidConfiguration(format!("cannot parse {}: {}", path.display(), e))
            })?;
            merge_values(&mut merged, layer);
            debug!(path = %path.display(), "config layer merged");
        }

        let config: FpsConfig = serde_json::from_value(merged)
            .map_err(|e| FpsError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验合并结果
    pub fn validate(&self) -> Result<()> {
        let layout = &self.positioner.identifier;
        if layout.total_bits() != 29 {
            return Err(FpsError::InvalidConfiguration(format!(
                "identifier layout must total 29 bits, got {}",
                layout.total_bits()
            )));
        }
        // UID 池是 u64 位图，字段宽度最多 6 位（63 个单播 UID）
        if layout.uid_bits == 0 || layout.uid_bits > 6 {
            return Err(FpsError::InvalidConfiguration(
                "uid_bits must be in 1..=6".into(),
            ));
        }
        if self.positioner.trajectory_chunk == 0 {
            return Err(FpsError::InvalidConfiguration(
                "trajectory_chunk must be at least 1".into(),
            ));
        }
        if self.positioner.time_step <= 0.0 {
            return Err(FpsError::InvalidConfiguration(
                "time_step must be positive".into(),
            ));
        }
        if self.positioner.position_tolerance <= 0.0 {
            return Err(FpsError::InvalidConfiguration(
                "position_tolerance must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poller.status_interval_s)
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poller.position_interval_s)
    }

    pub fn initialise_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.positioner.initialise_timeout_s)
    }

    pub fn trajectory_poll(&self) -> Duration {
        Duration::from_secs_f64(self.positioner.trajectory_poll_s)
    }
}

/// 递归地按键合并两个 JSON 值（`overlay` 覆盖 `base`）
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FpsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.positioner.trajectory_chunk, 3);
        assert_eq!(config.positioner.motor_steps, 1 << 30);
    }

    #[test]
    fn test_load_without_files_gives_defaults() {
        let config = FpsConfig::load(None, None).unwrap();
        assert_eq!(config.positioner.motor_speed, 2000.0);
    }

    #[test]
    fn test_user_layer_overrides_system_layer() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.json");
        let user = dir.path().join("user.json");

        let mut f = std::fs::File::create(&system).unwrap();
        write!(
            f,
            r#"{{"positioner": {{"motor_speed": 1000.0, "position_tolerance": 0.2}}}}"#
        )
        .unwrap();
        let mut f = std::fs::File::create(&user).unwrap();
        write!(f, r#"{{"positioner": {{"motor_speed": 3000.0}}}}"#).unwrap();

        let config = FpsConfig::load(Some(&system), Some(&user)).unwrap();
        // 用户层覆盖系统层
        assert_eq!(config.positioner.motor_speed, 3000.0);
        // 系统层覆盖默认值
        assert_eq!(config.positioner.position_tolerance, 0.2);
        // 未覆盖的键保持默认
        assert_eq!(config.positioner.trajectory_chunk, 3);
    }

    #[test]
    fn test_missing_layer_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            FpsConfig::load(Some(&dir.path().join("nope.json")), None).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_layer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            FpsConfig::load(Some(&bad), None),
            Err(FpsError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_invalid_identifier_layout_is_rejected() {
        let mut config = FpsConfig::default();
        config.positioner.identifier.uid_bits = 10;
        assert!(matches!(
            config.validate(),
            Err(FpsError::InvalidConfiguration(_))
        ));
    }
}
