//! 定位器状态
//!
//! `Positioner` 是纯值记录，只由协调器与解复用线程修改；
//! 外部观察者通过 `PositionerBank::snapshot` 拿副本。

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::status::{FirmwareVersion, StatusWord};

/// 定位器运行标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionerFlags {
    /// 禁用（粘性，重新初始化后保留）
    pub disabled: bool,
    /// 发现阶段未回复
    pub offline: bool,
    /// 碰撞检测被关闭
    pub no_collision_detect: bool,
    /// 开环模式
    pub open_loop: bool,
    /// bootloader 模式
    pub bootloader: bool,
    /// 已完成初始化流程
    pub initialised: bool,
}

/// 一台两轴光纤定位器的状态与参数
///
/// `id` 取值 1..N；0 是广播地址，不会出现定位器对象。
#[derive(Debug, Clone)]
pub struct Positioner {
    pub id: u16,
    /// alpha 轴角度（度），首次读取前为 `None`
    pub alpha: Option<f64>,
    /// beta 轴角度（度），首次读取前为 `None`
    pub beta: Option<f64>,
    /// 最近一次状态字
    pub status: StatusWord,
    pub firmware: Option<FirmwareVersion>,
    /// 发现阶段确定的 `(interface, bus)`
    pub interface: Option<usize>,
    pub bus: Option<usize>,
    pub flags: PositionerFlags,
    /// 当前两轴速度设置（RPM）
    pub speed: Option<(f64, f64)>,
    /// 本定位器累计执行的轨迹数
    pub trajectories: u64,
}

impl Positioner {
    pub fn new(id: u16) -> Self {
        debug_assert!(id != 0, "id 0 is the broadcast address");
        Self {
            id,
            alpha: None,
            beta: None,
            status: StatusWord::Unknown,
            firmware: None,
            interface: None,
            bus: None,
            flags: PositionerFlags::default(),
            speed: None,
            trajectories: 0,
        }
    }

    /// 当前位置 `(alpha, beta)`（两轴都已知时）
    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.alpha?, self.beta?))
    }

    /// 是否报告碰撞
    pub fn collided(&self) -> bool {
        self.status.is_collided()
    }

    /// 是否在运动（位移未完成）
    pub fn moving(&self) -> bool {
        !self.status.has_displacement_completed() && self.status != StatusWord::Unknown
    }

    /// 是否处于 bootloader 模式
    pub fn is_bootloader(&self) -> bool {
        self.firmware.map(|fw| fw.is_bootloader()).unwrap_or(false)
    }

    /// 能否接收轨迹（初始化完成、归零、静止、未禁用）
    pub fn ready_for_trajectory(&self) -> bool {
        !self.flags.disabled
            && !self.flags.offline
            && !self.is_bootloader()
            && self.status.is_initialised()
            && self.status.is_datum_initialised()
            && self.status.has_displacement_completed()
    }

    /// 重置易变状态（重新初始化时保留 disabled 标志）
    pub fn reset(&mut self) {
        self.alpha = None;
        self.beta = None;
        self.status = StatusWord::Unknown;
        self.firmware = None;
        self.speed = None;
        self.flags.initialised = false;
        self.flags.bootloader = false;
    }
}

// ============================================================================
// 定位器银行
// ============================================================================

/// 一次状态回复落账后的结论
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusChange {
    /// 该定位器已登记且状态已写入
    pub applied: bool,
    /// 状态字与上一次不同
    pub changed: bool,
    /// 新状态报告碰撞
    pub collided: bool,
}

/// 整个机群的定位器表
///
/// 状态 / 位置 / 固件字段由解复用线程单写；结构性变更
/// （增删、标志位）由协调器完成。观察者拿到的是快照。
#[derive(Default)]
pub struct PositionerBank {
    map: RwLock<BTreeMap<u16, Positioner>>,
}

impl PositionerBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一台定位器（已存在时保留原记录）
    pub fn insert(&self, positioner: Positioner) {
        let mut map = self.map.write();
        if let std::collections::btree_map::Entry::Vacant(entry) = map.entry(positioner.id) {
            entry.insert(positioner);
        } else {
            debug!(id = positioner.id, "positioner already registered");
        }
    }

    /// 移除全部定位器
    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.map.read().contains_key(&id)
    }

    /// 全部定位器 ID（升序）
    pub fn ids(&self) -> Vec<u16> {
        self.map.read().keys().copied().collect()
    }

    /// 单台快照
    pub fn get(&self, id: u16) -> Option<Positioner> {
        self.map.read().get(&id).cloned()
    }

    /// 全体快照
    pub fn snapshot(&self) -> Vec<Positioner> {
        self.map.read().values().cloned().collect()
    }

    /// 修改一台定位器
    pub fn update(&self, id: u16, f: impl FnOnce(&mut Positioner)) -> bool {
        let mut map = self.map.write();
        match map.get_mut(&id) {
            Some(positioner) => {
                f(positioner);
                true
            }
            None => false,
        }
    }

    /// 应用一条状态回复
    ///
    /// 只更新已登记的定位器（解复用线程不做结构性变更）。
    pub fn apply_status(&self, id: u16, raw: u32) -> StatusChange {
        let mut map = self.map.write();
        match map.get_mut(&id) {
            Some(positioner) => {
                let status = StatusWord::from_raw(raw, positioner.firmware);
                let changed = positioner.status != status;
                positioner.status = status;
                StatusChange {
                    applied: true,
                    changed,
                    collided: status.is_collided(),
                }
            }
            None => StatusChange::default(),
        }
    }

    /// 应用一条位置回复
    pub fn set_position(&self, id: u16, alpha: f64, beta: f64) {
        let mut map = self.map.write();
        if let Some(positioner) = map.get_mut(&id) {
            positioner.alpha = Some(alpha);
            positioner.beta = Some(beta);
        }
    }

    /// 应用一条固件版本回复
    pub fn set_firmware(&self, id: u16, firmware: FirmwareVersion) {
        let mut map = self.map.write();
        if let Some(positioner) = map.get_mut(&id) {
            positioner.firmware = Some(firmware);
            positioner.flags.bootloader = firmware.is_bootloader();
        }
    }

    /// 处于碰撞状态的定位器 ID
    pub fn collided_ids(&self) -> Vec<u16> {
        self.map
            .read()
            .values()
            .filter(|p| p.collided())
            .map(|p| p.id)
            .collect()
    }

    /// 是否有任何非禁用定位器在运动
    pub fn any_moving(&self) -> bool {
        self.map
            .read()
            .values()
            .any(|p| !p.flags.disabled && !p.flags.offline && p.moving())
    }
}
