//! 进程内虚拟总线（测试用）
//!
//! `VirtualNetwork` 模拟一组定位器固件：收到帧后同步生成回复，
//! 回复顺序由定位器 ID 决定，完全确定。支持测试需要的各种故障注入：
//!
//! - `mute`: 定位器不回复（模拟掉线）
//! - `reject_with`: 定位器以指定响应码拒绝命令
//! - `set_collided`: 注入碰撞状态位
//! - `set_connected(false)`: 模拟接口断开（`recv`/`send` 返回 `Disconnected`）
//! - `hold_start`: 忽略 `START_TRAJECTORY`（轨迹未启动的故障场景）
//!
//! 运动按时间模拟：`START_TRAJECTORY` 之后定位器进入运动状态，
//! 到达 `move_time` 截止时刻后，下一次状态/位置查询返回到位。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::protocol::commands::{
    decode_position, encode_firmware, encode_position, encode_status, CommandId,
};
use crate::protocol::status::{FirmwareVersion, PositionerStatusV41, ResponseCode};
use crate::protocol::{read_i32_le, read_u32_le, IdentifierLayout, DEFAULT_MOTOR_STEPS,
    DEFAULT_TIME_STEP};

use super::{BusAdapter, CanError, FpsFrame};

/// 虚拟定位器的初始状态位（已初始化、已归零、闭环、静止）
fn default_status() -> PositionerStatusV41 {
    PositionerStatusV41::SYSTEM_INITIALIZED
        | PositionerStatusV41::DISPLACEMENT_COMPLETED
        | PositionerStatusV41::DATUM_ALPHA_INITIALIZED
        | PositionerStatusV41::DATUM_BETA_INITIALIZED
        | PositionerStatusV41::CLOSED_LOOP_ALPHA
        | PositionerStatusV41::CLOSED_LOOP_BETA
}

/// 一个被模拟的定位器
#[derive(Debug, Clone)]
pub struct VirtualPositioner {
    pub id: u16,
    pub bus: usize,
    pub firmware: FirmwareVersion,
    pub status: PositionerStatusV41,
    pub alpha: f64,
    pub beta: f64,
    /// 不回复任何命令（模拟掉线）
    pub mute: bool,
    /// 以该响应码拒绝所有命令
    pub reject_with: Option<ResponseCode>,

    // 轨迹接收状态
    expected_points: Option<(u32, u32)>,
    alpha_points: Vec<(f64, f64)>,
    beta_points: Vec<(f64, f64)>,
    armed: Option<ArmedMove>,
    deadline: Option<Instant>,
    target: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct ArmedMove {
    target: (f64, f64),
    move_time: Duration,
}

impl VirtualPositioner {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            bus: 0,
            firmware: FirmwareVersion::new(4, 1, 0),
            status: default_status(),
            alpha: 0.0,
            beta: 0.0,
            mute: false,
            reject_with: None,
            expected_points: None,
            alpha_points: Vec::new(),
            beta_points: Vec::new(),
            armed: None,
            deadline: None,
            target: None,
        }
    }

    /// 到达运动截止时刻后落位
    fn advance(&mut self) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                if let Some((alpha, beta)) = self.target.take() {
                    self.alpha = alpha;
                    self.beta = beta;
                }
                self.status |= PositionerStatusV41::DISPLACEMENT_COMPLETED;
                self.deadline = None;
            }
        }
    }
}

struct NetworkInner {
    layout: IdentifierLayout,
    motor_steps: i64,
    time_step: f64,
    positioners: BTreeMap<u16, VirtualPositioner>,
    sent: Vec<FpsFrame>,
    connected: bool,
    hold_start: bool,
    reply_tx: Sender<(FpsFrame, usize)>,
    reply_rx: Receiver<(FpsFrame, usize)>,
}

/// 虚拟定位器网络
///
/// Clone 共享同一内部状态；`bus()` 创建连到该网络的适配器。
#[derive(Clone)]
pub struct VirtualNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl VirtualNetwork {
    /// 创建网络并放入给定 ID 的定位器（默认固件 04.01.00）
    pub fn new(positioner_ids: &[u16]) -> Self {
        let (reply_tx, reply_rx) = unbounded();
        let positioners = positioner_ids
            .iter()
            .map(|&id| (id, VirtualPositioner::new(id)))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                layout: IdentifierLayout::default(),
                motor_steps: DEFAULT_MOTOR_STEPS,
                time_step: DEFAULT_TIME_STEP,
                positioners,
                sent: Vec::new(),
                connected: true,
                hold_start: false,
                reply_tx,
                reply_rx,
            })),
        }
    }

    /// 创建连到该网络的总线适配器
    pub fn bus(&self) -> VirtualBus {
        let rx = self.inner.lock().reply_rx.clone();
        VirtualBus {
            name: "virtual://0".to_string(),
            buses: vec![0],
            network: self.clone(),
            rx,
        }
    }

    /// 修改一个定位器（不存在时 panic，测试专用接口）
    pub fn with_positioner(&self, id: u16, f: impl FnOnce(&mut VirtualPositioner)) {
        let mut inner = self.inner.lock();
        let positioner = inner
            .positioners
            .get_mut(&id)
            .unwrap_or_else(|| panic!("virtual positioner {} not found", id));
        f(positioner);
    }

    /// 读取一个定位器的快照
    pub fn positioner(&self, id: u16) -> Option<VirtualPositioner> {
        self.inner.lock().positioners.get(&id).cloned()
    }

    /// 注入碰撞状态位（beta 轴）
    pub fn set_collided(&self, id: u16) {
        self.with_positioner(id, |p| {
            p.status |= PositionerStatusV41::COLLISION_BETA;
            // 碰撞即停
            p.deadline = None;
            p.target = None;
            p.status |= PositionerStatusV41::DISPLACEMENT_COMPLETED;
        });
    }

    /// 断开 / 恢复连接
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// 忽略 `START_TRAJECTORY`（轨迹不会真正启动）
    pub fn hold_start(&self, hold: bool) {
        self.inner.lock().hold_start = hold;
    }

    /// 主机发出的全部帧
    pub fn sent_frames(&self) -> Vec<FpsFrame> {
        self.inner.lock().sent.clone()
    }

    /// 主机发往某操作码的帧
    pub fn sent_for(&self, command: CommandId) -> Vec<FpsFrame> {
        let inner = self.inner.lock();
        let layout = inner.layout;
        inner
            .sent
            .iter()
            .filter(|f| layout.decode(f.id).command_id == command as u8)
            .copied()
            .collect()
    }

    /// 清空已记录的帧
    pub fn clear_sent(&self) {
        self.inner.lock().sent.clear();
    }

    /// 处理一帧主机命令，生成确定顺序的回复
    fn handle_frame(&self, frame: FpsFrame) {
        let mut inner = self.inner.lock();
        inner.sent.push(frame);

        let fields = inner.layout.decode(frame.id);
        let command = match CommandId::from_u8(fields.command_id) {
            Some(cmd) => cmd,
            None => {
                trace!(command_id = fields.command_id, "virtual: unknown opcode");
                return;
            }
        };

        let hold_start = inner.hold_start;
        let motor_steps = inner.motor_steps;
        let time_step = inner.time_step;
        let layout = inner.layout;
        let reply_tx = inner.reply_tx.clone();

        let ids: Vec<u16> = if fields.positioner_id == 0 {
            inner.positioners.keys().copied().collect()
        } else {
            vec![fields.positioner_id]
        };

        for id in ids {
            let positioner = match inner.positioners.get_mut(&id) {
                Some(p) if !p.mute => p,
                _ => continue,
            };

            let (code, payload) = Self::dispatch(
                positioner,
                command,
                frame.data_slice(),
                hold_start,
                motor_steps,
                time_step,
            );

            let reply_id = layout.encode(id, command as u8, fields.uid, code as u8);
            let reply = FpsFrame::new_extended(reply_id, &payload);
            let bus = positioner.bus;
            let _ = reply_tx.send((reply, bus));
        }
    }

    fn dispatch(
        p: &mut VirtualPositioner,
        command: CommandId,
        data: &[u8],
        hold_start: bool,
        motor_steps: i64,
        time_step: f64,
    ) -> (ResponseCode, Vec<u8>) {
        if let Some(code) = p.reject_with {
            return (code, Vec::new());
        }

        match command {
            CommandId::GetId => (ResponseCode::CommandAccepted, Vec::new()),

            CommandId::GetFirmwareVersion => {
                (ResponseCode::CommandAccepted, encode_firmware(p.firmware).to_vec())
            }

            CommandId::GetStatus => {
                p.advance();
                (
                    ResponseCode::CommandAccepted,
                    encode_status(p.status.bits() as u32).to_vec(),
                )
            }

            CommandId::GetActualPosition => {
                p.advance();
                (
                    ResponseCode::CommandAccepted,
                    encode_position(p.alpha, p.beta, motor_steps).to_vec(),
                )
            }

            CommandId::SetActualPosition => {
                if let Ok((alpha, beta)) = decode_position(data, motor_steps) {
                    p.alpha = alpha;
                    p.beta = beta;
                }
                (ResponseCode::CommandAccepted, Vec::new())
            }

            CommandId::SendNewTrajectory => {
                let n_alpha = read_u32_le(data, 0).unwrap_or(0);
                let n_beta = read_u32_le(data, 4).unwrap_or(0);
                p.expected_points = Some((n_alpha, n_beta));
                p.alpha_points.clear();
                p.beta_points.clear();
                p.armed = None;
                p.status |= PositionerStatusV41::RECEIVING_TRAJECTORY;
                (ResponseCode::CommandAccepted, Vec::new())
            }

            CommandId::SendTrajectoryData => {
                // alpha 数据先到：alpha 未满则归 alpha，否则归 beta
                let steps = read_i32_le(data, 0).unwrap_or(0);
                let ticks = read_i32_le(data, 4).unwrap_or(0);
                let angle = steps as f64 / motor_steps as f64 * 360.0;
                let time = ticks as f64 * time_step;

                let (n_alpha, _) = p.expected_points.unwrap_or((0, 0));
                if (p.alpha_points.len() as u32) < n_alpha {
                    p.alpha_points.push((angle, time));
                } else {
                    p.beta_points.push((angle, time));
                }
                (ResponseCode::CommandAccepted, Vec::new())
            }

            CommandId::TrajectoryDataEnd => {
                p.status -= PositionerStatusV41::RECEIVING_TRAJECTORY;
                let target_alpha = p.alpha_points.last().map(|&(a, _)| a).unwrap_or(p.alpha);
                let target_beta = p.beta_points.last().map(|&(b, _)| b).unwrap_or(p.beta);
                let move_time = p
                    .alpha_points
                    .iter()
                    .chain(p.beta_points.iter())
                    .map(|&(_, t)| t)
                    .fold(0.0f64, f64::max);
                p.armed = Some(ArmedMove {
                    target: (target_alpha, target_beta),
                    move_time: Duration::from_secs_f64(move_time),
                });
                (ResponseCode::CommandAccepted, Vec::new())
            }

            CommandId::StartTrajectory => {
                if !hold_start {
                    if let Some(armed) = p.armed.take() {
                        p.status -= PositionerStatusV41::DISPLACEMENT_COMPLETED;
                        p.target = Some(armed.target);
                        p.deadline = Some(Instant::now() + armed.move_time);
                    }
                }
                (ResponseCode::CommandAccepted, Vec::new())
            }

            CommandId::SendTrajectoryAbort => {
                // 保留碰撞标志位
                p.armed = None;
                p.deadline = None;
                p.target = None;
                p.expected_points = None;
                p.status -= PositionerStatusV41::RECEIVING_TRAJECTORY;
                p.status |= PositionerStatusV41::DISPLACEMENT_COMPLETED;
                (ResponseCode::CommandAccepted, Vec::new())
            }

            CommandId::StopTrajectory => {
                // stop 会清掉碰撞标志位
                p.armed = None;
                p.deadline = None;
                p.target = None;
                p.status -= PositionerStatusV41::COLLISION_ALPHA;
                p.status -= PositionerStatusV41::COLLISION_BETA;
                p.status |= PositionerStatusV41::DISPLACEMENT_COMPLETED;
                (ResponseCode::CommandAccepted, Vec::new())
            }

            // 其余配置类命令一律接受
            _ => (ResponseCode::CommandAccepted, Vec::new()),
        }
    }
}

/// 连到 `VirtualNetwork` 的总线适配器
pub struct VirtualBus {
    name: String,
    buses: Vec<usize>,
    network: VirtualNetwork,
    rx: Receiver<(FpsFrame, usize)>,
}

impl BusAdapter for VirtualBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn buses(&self) -> &[usize] {
        &self.buses
    }

    fn send(&mut self, frame: &FpsFrame, _bus: Option<usize>) -> Result<(), CanError> {
        if !self.network.is_connected() {
            return Err(CanError::Disconnected);
        }
        self.network.handle_frame(*frame);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<(FpsFrame, usize)>, CanError> {
        if !self.network.is_connected() {
            return Err(CanError::Disconnected);
        }
        match self.rx.recv_timeout(timeout) {
            Ok((frame, bus)) => Ok(Some((frame, bus))),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(CanError::Disconnected),
        }
    }

    fn reconnect(&mut self) -> Result<(), CanError> {
        if self.network.is_connected() {
            // 丢掉断线期间残留的回复
            while self.rx.try_recv().is_ok() {}
            Ok(())
        } else {
            Err(CanError::Disconnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> IdentifierLayout {
        IdentifierLayout::default()
    }

    #[test]
    fn test_firmware_reply() {
        let network = VirtualNetwork::new(&[4]);
        let mut bus = network.bus();

        let id = layout().encode(4, CommandId::GetFirmwareVersion as u8, 1, 0);
        bus.send(&FpsFrame::new_extended(id, &[]), None).unwrap();

        let (reply, _) = bus.recv(Duration::from_millis(100)).unwrap().unwrap();
        let fields = layout().decode(reply.id);
        assert_eq!(fields.positioner_id, 4);
        assert_eq!(fields.uid, 1);
        assert_eq!(fields.response_code, 0);
        assert_eq!(reply.data_slice(), &[0, 1, 4]);
    }

    #[test]
    fn test_broadcast_reaches_all_but_muted() {
        let network = VirtualNetwork::new(&[4, 8, 13]);
        network.with_positioner(13, |p| p.mute = true);
        let mut bus = network.bus();

        let id = layout().encode(0, CommandId::GetStatus as u8, 0, 0);
        bus.send(&FpsFrame::new_extended(id, &[]), None).unwrap();

        let mut replies = Vec::new();
        while let Some((frame, _)) = bus.recv(Duration::from_millis(50)).unwrap() {
            replies.push(layout().decode(frame.id).positioner_id);
        }
        assert_eq!(replies, vec![4, 8]);
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let network = VirtualNetwork::new(&[4]);
        let mut bus = network.bus();

        network.set_connected(false);
        assert!(matches!(
            bus.recv(Duration::from_millis(10)),
            Err(CanError::Disconnected)
        ));
        assert!(bus.reconnect().is_err());

        network.set_connected(true);
        assert!(bus.reconnect().is_ok());
        assert!(bus.recv(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_trajectory_motion_simulation() {
        let network = VirtualNetwork::new(&[4]);
        let mut bus = network.bus();
        let send = |bus: &mut VirtualBus, cmd: CommandId, pid: u16, data: &[u8]| {
            let id = layout().encode(pid, cmd as u8, if pid == 0 { 0 } else { 1 }, 0);
            bus.send(&FpsFrame::new_extended(id, data), None).unwrap();
            // 丢掉回复
            while bus.recv(Duration::from_millis(10)).unwrap().is_some() {}
        };

        send(&mut bus, CommandId::SendNewTrajectory, 4, &crate::protocol::commands::encode_new_trajectory(2, 2));
        for &(angle, time) in &[(0.0, 0.0), (90.0, 0.1)] {
            let data = crate::protocol::commands::encode_trajectory_point(
                angle, time, DEFAULT_MOTOR_STEPS, DEFAULT_TIME_STEP);
            send(&mut bus, CommandId::SendTrajectoryData, 4, &data);
        }
        for &(angle, time) in &[(0.0, 0.0), (45.0, 0.1)] {
            let data = crate::protocol::commands::encode_trajectory_point(
                angle, time, DEFAULT_MOTOR_STEPS, DEFAULT_TIME_STEP);
            send(&mut bus, CommandId::SendTrajectoryData, 4, &data);
        }
        send(&mut bus, CommandId::TrajectoryDataEnd, 4, &[]);
        send(&mut bus, CommandId::StartTrajectory, 0, &[]);

        // 运动中
        let snapshot = network.positioner(4).unwrap();
        assert!(!snapshot.status.contains(PositionerStatusV41::DISPLACEMENT_COMPLETED));

        std::thread::sleep(Duration::from_millis(150));
        send(&mut bus, CommandId::GetStatus, 4, &[]);

        let snapshot = network.positioner(4).unwrap();
        assert!(snapshot.status.contains(PositionerStatusV41::DISPLACEMENT_COMPLETED));
        assert!((snapshot.alpha - 90.0).abs() < 1e-6);
        assert!((snapshot.beta - 45.0).abs() < 1e-6);
    }
}
