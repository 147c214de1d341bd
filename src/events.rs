//! 操作面事件与请求类型
//!
//! 核心只约定类型：事件经内部事件总线广播给订阅者，
//! 请求由 `Fps::handle_request` 分发。对外的 TCP 行协议 /
//! JSON 包装不在本 crate 范围内。

use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::trajectory::TrajectoryData;

/// 机群事件
#[derive(Debug, Clone)]
pub enum FpsEvent {
    /// 某定位器状态字发生变化
    StatusChanged { positioner_id: u16, raw: u32 },
    /// 轨迹开始执行
    TrajectoryStarted { positioner_ids: Vec<u16> },
    /// 轨迹结束（成功或失败）
    TrajectoryFinished { success: bool },
    /// 机群被锁定
    Locked { locked_by: Vec<u16> },
    /// 机群解锁
    Unlocked,
    /// 新定位器登记
    PositionerAdded { positioner_id: u16 },
    /// 发现流程完成
    DiscoveryComplete { found: Vec<u16> },
    /// 接口断开后重连成功
    TransportReset { interface: usize },
    /// 需要操作员关注的告警（轮询连续失败等）
    Alert { message: String },
}

/// 操作请求
#[derive(Debug, Clone)]
pub enum FpsRequest {
    Goto {
        targets: HashMap<u16, (f64, f64)>,
        speed: Option<f64>,
    },
    SendTrajectory(TrajectoryData),
    Abort,
    Lock,
    Unlock,
    Enable(u16),
    Disable(u16),
    /// 重新初始化机群
    Reload,
    GetStatus,
}

/// 请求的应答
#[derive(Debug, Clone)]
pub enum FpsResponse {
    Ok,
    Status {
        locked: bool,
        locked_by: Vec<u16>,
        moving: bool,
        n_positioners: usize,
        trajectories_executed: u64,
    },
}

/// 多订阅者事件总线
///
/// 发布是非阻塞的；已断开的订阅者在发布时被清理。
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<FpsEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> Receiver<FpsEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 广播一个事件
    pub fn publish(&self, event: FpsEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
