//! CAN 调度器
//!
//! 负责排序、互斥与扇出：
//!
//! - 互斥键为 `(command_id, positioner_id)`；广播键 `(command_id, 0)`
//!   与该命令号的所有单播相互排斥。冲突的提交按票号 FIFO 排队。
//! - UID 按 `(command_id, positioner_id)` 成池分配（最低零位，O(1)），
//!   互斥规则保证池不会耗尽，池在这里充当滚动 nonce。
//! - 单播按发现阶段学到的 `(interface, bus)` 路由；广播发往所有接口
//!   的所有总线。
//!
//! 线程模型：每个接口一个 IO 线程（阻塞接收与非阻塞发送交织，
//! 发送绝不阻塞接收路径），一个解复用线程统一处理入站帧——
//! 它是定位器状态/位置的唯一写者。接口故障时在后台按退避间隔重连，
//! 受影响的在途命令全部标记传输失败，不做自动重试。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::can::{BusAdapter, CanError, FpsFrame, TaggedFrame};
use crate::command::{Command, CommandShared, CommandStatus, Reply, ReplyOutcome};
use crate::error::{FpsError, Result};
use crate::positioner::PositionerBank;
use crate::protocol::commands::{
    decode_firmware, decode_position, decode_status, CommandId,
};
use crate::protocol::status::ResponseCode;
use crate::protocol::{IdentifierLayout, BROADCAST_ID};

/// IO 线程的接收轮询粒度
const RECV_TIMEOUT: Duration = Duration::from_millis(2);

/// 每个接口的出站背压上限
const OUTBOUND_BACKLOG: usize = 64;

/// 重连退避区间
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(10);

// ============================================================================
// 对外事件
// ============================================================================

/// 调度器向协调器上报的异步事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// 某定位器状态字发生变化
    StatusChanged {
        positioner_id: u16,
        raw: u32,
        collided: bool,
    },
    /// 观测到碰撞（固件主动上报）
    CollisionDetected(u16),
    /// 接口故障，在途命令已标记失败
    TransportError(usize),
    /// 接口重连成功
    TransportReset(usize),
}

// ============================================================================
// 命令句柄与结果
// ============================================================================

/// 命令的执行结果
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub status: CommandStatus,
    pub replies: Vec<Reply>,
    /// 失败是否由接口故障导致
    pub transport_error: bool,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Done
    }

    /// 第一条非接受回复
    pub fn first_rejection(&self) -> Option<&Reply> {
        self.replies
            .iter()
            .find(|r| !r.response_code.is_accepted())
    }

    /// 把非成功状态映射为错误
    pub fn into_result(self) -> Result<CommandResult> {
        match self.status {
            CommandStatus::Done => Ok(self),
            CommandStatus::TimedOut => Err(FpsError::Timeout(self.command_id)),
            CommandStatus::Cancelled => Err(FpsError::Cancelled(self.command_id)),
            _ if self.transport_error => Err(FpsError::Can(CanError::Disconnected)),
            _ => {
                let code = self
                    .first_rejection()
                    .map(|r| r.response_code)
                    .unwrap_or(ResponseCode::InvalidCommand);
                Err(FpsError::Command {
                    command: self.command_id,
                    code,
                })
            }
        }
    }
}

/// 已提交命令的可等待句柄
///
/// `wait()` 负责执行超时裁决；句柄被丢弃则命令脱离跟踪，
/// 迟到的回复由解复用线程丢弃。
pub struct CommandHandle {
    core: Arc<SchedulerCore>,
    shared: Arc<CommandShared>,
}

impl CommandHandle {
    pub fn command_id(&self) -> CommandId {
        self.shared.command_id
    }

    pub fn status(&self) -> CommandStatus {
        self.shared.status()
    }

    /// 阻塞等待命令结束（含超时裁决）
    ///
    /// 超时从提交时刻起算，不是从调用本方法起算。
    pub fn wait(&self) -> CommandResult {
        let remaining = self
            .shared
            .timeout
            .saturating_sub(self.shared.started_at.elapsed());
        let status = self.shared.wait(remaining);
        if !status.is_done() {
            // 超时：广播按"已有回复即完成"裁决，单播视为超时
            let verdict = self.shared.timeout_status();
            self.core.finalize(&self.shared, verdict);
        }
        self.result()
    }

    /// 取消命令；运动类操作码会补发一条轨迹中止
    pub fn cancel(&self) {
        SchedulerCore::cancel(&self.core, &self.shared, true);
    }

    fn result(&self) -> CommandResult {
        CommandResult {
            command_id: self.shared.command_id,
            status: self.shared.status(),
            replies: self.shared.replies(),
            transport_error: self.shared.transport_error.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// UID 池
// ============================================================================

/// 按 `(command_id, positioner_id)` 分键的 UID 位图池
struct UidPool {
    pool_size: u8,
    pools: Mutex<HashMap<(u8, u16), u64>>,
}

impl UidPool {
    fn new(pool_size: u8) -> Self {
        Self {
            pool_size,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// 分配最低可用 UID（1 起），耗尽返回 `None`
    fn allocate(&self, command_id: u8, positioner_id: u16) -> Option<u8> {
        let mut pools = self.pools.lock();
        let bits = pools.entry((command_id, positioner_id)).or_insert(0);
        let mask = if self.pool_size >= 64 {
            u64::MAX
        } else {
            (1u64 << self.pool_size) - 1
        };
        let free = !*bits & mask;
        if free == 0 {
            return None;
        }
        let slot = free.trailing_zeros();
        *bits |= 1u64 << slot;
        Some(slot as u8 + 1)
    }

    fn release(&self, command_id: u8, positioner_id: u16, uid: u8) {
        debug_assert!(uid >= 1);
        let mut pools = self.pools.lock();
        if let Some(bits) = pools.get_mut(&(command_id, positioner_id)) {
            *bits &= !(1u64 << (uid - 1));
        }
    }

    /// 当前在用的 UID 数
    #[cfg(test)]
    fn in_use(&self, command_id: u8, positioner_id: u16) -> u32 {
        self.pools
            .lock()
            .get(&(command_id, positioner_id))
            .map_or(0, |bits| bits.count_ones())
    }
}

// ============================================================================
// 互斥表
// ============================================================================

#[derive(Default)]
struct ExclusionInner {
    /// 活动中的作用域（含广播作用域 `(cid, 0)`）
    busy: HashSet<(u8, u16)>,
    /// 每个命令号活动中的单播数
    unicast_active: HashMap<u8, usize>,
    /// 每个作用域的 FIFO 等待队列（票号）
    queues: HashMap<(u8, u16), VecDeque<u64>>,
    next_ticket: u64,
}

/// `(command_id, positioner_id)` 互斥表
///
/// 多定位器命令一次性取得全部作用域；注册在锁内完成，
/// 票号给出全局一致的顺序，因此不会死锁。
struct Exclusion {
    inner: Mutex<ExclusionInner>,
    cond: Condvar,
}

impl Exclusion {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ExclusionInner::default()),
            cond: Condvar::new(),
        }
    }

    /// 阻塞直至拿到 `command_id` 下所有 `scope` 作用域
    fn acquire(&self, command_id: u8, scope: &[u16]) {
        let mut inner = self.inner.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        for &pid in scope {
            inner
                .queues
                .entry((command_id, pid))
                .or_default()
                .push_back(ticket);
        }

        loop {
            let admissible = scope.iter().all(|&pid| {
                let key = (command_id, pid);
                let first_in_queue = inner.queues[&key].front() == Some(&ticket);
                let free = !inner.busy.contains(&key);
                let broadcast_rule = if pid == BROADCAST_ID {
                    // 广播要等该命令号的所有单播排空
                    inner.unicast_active.get(&command_id).copied().unwrap_or(0) == 0
                } else {
                    // 单播要让路给活动中以及排队中的广播
                    !inner.busy.contains(&(command_id, BROADCAST_ID))
                        && inner
                            .queues
                            .get(&(command_id, BROADCAST_ID))
                            .map_or(true, |q| q.is_empty())
                };
                first_in_queue && free && broadcast_rule
            });

            if admissible {
                for &pid in scope {
                    let key = (command_id, pid);
                    inner.queues.get_mut(&key).unwrap().pop_front();
                    inner.busy.insert(key);
                    if pid != BROADCAST_ID {
                        *inner.unicast_active.entry(command_id).or_insert(0) += 1;
                    }
                }
                return;
            }

            self.cond.wait(&mut inner);
        }
    }

    fn release(&self, command_id: u8, scope: &[u16]) {
        let mut inner = self.inner.lock();
        for &pid in scope {
            let key = (command_id, pid);
            inner.busy.remove(&key);
            if pid != BROADCAST_ID {
                if let Some(count) = inner.unicast_active.get_mut(&command_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        inner.unicast_active.remove(&command_id);
                    }
                }
            }
            if inner.queues.get(&key).is_some_and(|q| q.is_empty()) {
                inner.queues.remove(&key);
            }
        }
        drop(inner);
        self.cond.notify_all();
    }
}

// ============================================================================
// 接口与线程
// ============================================================================

struct Outbound {
    frame: FpsFrame,
    bus: Option<usize>,
}

struct InterfaceHandle {
    name: String,
    cmd_tx: Sender<Outbound>,
    alive: Arc<AtomicBool>,
}

enum DemuxMsg {
    Frame(TaggedFrame),
    InterfaceDown(usize),
    InterfaceUp(usize),
}

// ============================================================================
// 调度器核心
// ============================================================================

struct SchedulerCore {
    layout: IdentifierLayout,
    motor_steps: i64,
    uid_pool: UidPool,
    exclusion: Exclusion,
    /// 在途命令表，键为打包后的 `(positioner_id, command_id, uid)`
    running: Mutex<HashMap<u64, Arc<CommandShared>>>,
    interfaces: Vec<InterfaceHandle>,
    /// 发现阶段学到的 `positioner -> (interface, bus)` 映射
    routes: RwLock<HashMap<u16, (usize, usize)>>,
    bank: Arc<PositionerBank>,
    events_tx: Sender<SchedulerEvent>,
    shutdown: AtomicBool,
}

fn running_key(positioner_id: u16, command_id: u8, uid: u8) -> u64 {
    ((positioner_id as u64) << 16) | ((command_id as u64) << 8) | uid as u64
}

impl SchedulerCore {
    /// 终结一条命令：设状态、摘表、归还 UID、释放互斥
    ///
    /// 以 running 表的移除作为一次性屏障，重复调用是空操作。
    fn finalize(&self, shared: &Arc<CommandShared>, status: CommandStatus) {
        shared.finish(status);

        let command_id = shared.command_id as u8;
        let mut running = self.running.lock();
        let first_key = if shared.is_broadcast {
            running_key(BROADCAST_ID, command_id, 0)
        } else {
            match shared.uids.first() {
                Some(&(pid, uid)) => running_key(pid, command_id, uid),
                None => return,
            }
        };
        if running.remove(&first_key).is_none() {
            // 已被其他路径清理
            return;
        }
        for &(pid, uid) in shared.uids.iter().skip(1) {
            running.remove(&running_key(pid, command_id, uid));
        }
        drop(running);

        for &(pid, uid) in &shared.uids {
            self.uid_pool.release(command_id, pid, uid);
        }
        self.exclusion.release(command_id, &shared.scope());

        debug!(
            command = shared.command_id.name(),
            status = ?shared.status(),
            "command finalized"
        );
    }

    /// 取消一条命令
    fn cancel(core: &Arc<Self>, shared: &Arc<CommandShared>, with_abort: bool) {
        core.finalize(shared, CommandStatus::Cancelled);

        // 运动类操作码补发中止，约束定位器停在原地
        if with_abort && shared.command_id.spec().move_command {
            let scope = shared.scope();
            let abort = if scope == [BROADCAST_ID] {
                Command::broadcast(CommandId::SendTrajectoryAbort)
            } else {
                Command::new(CommandId::SendTrajectoryAbort, scope)
            }
            .with_timeout(Duration::ZERO);
            if let Err(e) = Self::submit(core, abort) {
                warn!(error = %e, "failed to issue abort for cancelled command");
            }
        }
    }

    /// 取消所有非安全的在途命令（FPS 上锁路径）
    fn cancel_non_safe(core: &Arc<Self>) {
        Self::cancel_matching(core, |shared| !shared.command_id.spec().safe);
    }

    /// 取消所有在途的运动命令（停止轨迹路径）
    fn cancel_moves(core: &Arc<Self>) {
        Self::cancel_matching(core, |shared| shared.command_id.spec().move_command);
    }

    fn cancel_matching(core: &Arc<Self>, predicate: impl Fn(&Arc<CommandShared>) -> bool) {
        let affected: Vec<Arc<CommandShared>> = {
            let running = core.running.lock();
            running.values().filter(|s| predicate(*s)).cloned().collect()
        };
        for shared in affected {
            // 调用方会统一广播中止，这里不必逐条补发
            Self::cancel(core, &shared, false);
        }
    }

    /// 提交一条命令（校验、互斥、组帧、扇出）
    fn submit(core: &Arc<Self>, command: Command) -> Result<CommandHandle> {
        if core.shutdown.load(Ordering::Acquire) {
            return Err(FpsError::ShutDown);
        }

        let spec = command.command_id.spec();
        let pids = &command.positioner_ids;

        if pids.is_empty() {
            return Err(FpsError::InvalidConfiguration(
                "command addresses no positioners".into(),
            ));
        }
        {
            let mut sorted = pids.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != pids.len() {
                return Err(FpsError::InvalidConfiguration(
                    "positioner list contains duplicates".into(),
                ));
            }
        }
        if pids.contains(&BROADCAST_ID) && pids.len() > 1 {
            return Err(FpsError::MixedBroadcast);
        }
        let is_broadcast = command.is_broadcast();
        if is_broadcast && !spec.broadcastable {
            return Err(FpsError::NotBroadcastable(command.command_id));
        }
        if is_broadcast && command.payloads_for(BROADCAST_ID).len() > 1 {
            return Err(FpsError::InvalidConfiguration(
                "broadcasts can only carry a single message".into(),
            ));
        }

        let command_id = command.command_id as u8;
        let scope: Vec<u16> = if is_broadcast {
            vec![BROADCAST_ID]
        } else {
            let mut sorted = pids.clone();
            sorted.sort_unstable();
            sorted
        };

        core.exclusion.acquire(command_id, &scope);

        match Self::build_and_send(core, &command, is_broadcast) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                core.exclusion.release(command_id, &scope);
                Err(e)
            }
        }
    }

    /// 分配 UID、组帧、登记并写入接口通道
    fn build_and_send(core: &Arc<Self>, command: &Command, is_broadcast: bool) -> Result<CommandHandle> {
        let command_id = command.command_id as u8;

        // --- 分配 UID 并组帧 ---
        let mut uids: Vec<(u16, u8)> = Vec::new();
        let mut frames: Vec<(u16, FpsFrame)> = Vec::new();

        if is_broadcast {
            let payload = command.payloads_for(BROADCAST_ID).remove(0);
            let id = core.layout.encode(BROADCAST_ID, command_id, 0, 0);
            frames.push((BROADCAST_ID, FpsFrame::new_extended(id, &payload)));
        } else {
            for &pid in &command.positioner_ids {
                for payload in command.payloads_for(pid) {
                    let uid = match core.uid_pool.allocate(command_id, pid) {
                        Some(uid) => uid,
                        None => {
                            for &(p, u) in &uids {
                                core.uid_pool.release(command_id, p, u);
                            }
                            return Err(FpsError::EmptyPool {
                                command: command.command_id,
                                positioner_id: pid,
                            });
                        }
                    };
                    uids.push((pid, uid));
                    let id = core.layout.encode(pid, command_id, uid, 0);
                    frames.push((pid, FpsFrame::new_extended(id, &payload)));
                }
            }
        }
        let n_messages = frames.len();

        // --- 选定接口 ---
        let alive: Vec<usize> = core
            .interfaces
            .iter()
            .enumerate()
            .filter(|(_, i)| i.alive.load(Ordering::Acquire))
            .map(|(idx, _)| idx)
            .collect();
        if alive.is_empty() {
            for &(p, u) in &uids {
                core.uid_pool.release(command_id, p, u);
            }
            return Err(FpsError::Can(CanError::Disconnected));
        }

        let mut used_ifaces: Vec<usize> = Vec::new();
        let mut plan: Vec<(usize, Outbound)> = Vec::new();
        for &(pid, frame) in &frames {
            if is_broadcast {
                for &idx in &alive {
                    plan.push((idx, Outbound { frame, bus: None }));
                }
                used_ifaces.extend(alive.iter().copied());
                continue;
            }
            match core.routes.read().get(&pid).copied() {
                Some((iface, bus)) if alive.contains(&iface) => {
                    plan.push((iface, Outbound { frame, bus: Some(bus) }));
                    used_ifaces.push(iface);
                }
                Some((iface, _)) => {
                    // 路由指向的接口已离线
                    for &(p, u) in &uids {
                        core.uid_pool.release(command_id, p, u);
                    }
                    warn!(positioner_id = pid, interface = iface, "route interface is down");
                    return Err(FpsError::Can(CanError::Disconnected));
                }
                None => {
                    // 尚无路由（发现阶段之前）：发往所有活动接口
                    for &idx in &alive {
                        plan.push((idx, Outbound { frame, bus: None }));
                    }
                    used_ifaces.extend(alive.iter().copied());
                }
            }
        }
        used_ifaces.sort_unstable();
        used_ifaces.dedup();

        // --- 登记 ---
        let fire_and_forget = command.effective_timeout().is_zero();
        let shared = Arc::new(CommandShared::new(command, uids, used_ifaces, n_messages));

        if !fire_and_forget {
            let mut running = core.running.lock();
            if is_broadcast {
                running.insert(running_key(BROADCAST_ID, command_id, 0), Arc::clone(&shared));
            } else {
                for &(pid, uid) in &shared.uids {
                    running.insert(running_key(pid, command_id, uid), Arc::clone(&shared));
                }
            }
        }

        // --- 写入接口通道（有界，写满时阻塞形成背压） ---
        trace!(
            command = command.command_id.name(),
            messages = n_messages,
            broadcast = is_broadcast,
            "sending command"
        );
        for (iface, outbound) in plan {
            if core.interfaces[iface].cmd_tx.send(outbound).is_err() {
                // IO 线程已退出（关停中）
                core.release_unregistered(&shared, command_id, fire_and_forget);
                return Err(FpsError::ShutDown);
            }
        }

        if fire_and_forget {
            // 即发即忘：立刻归还 UID 与互斥，迟到的回复自然被丢弃
            shared.finish(CommandStatus::Done);
            for &(pid, uid) in &shared.uids {
                core.uid_pool.release(command_id, pid, uid);
            }
            core.exclusion.release(command_id, &shared.scope());
        }

        Ok(CommandHandle {
            core: Arc::clone(core),
            shared,
        })
    }

    /// 发送失败时的清理（已登记的走 finalize，未登记的直接归还）
    fn release_unregistered(
        &self,
        shared: &Arc<CommandShared>,
        command_id: u8,
        fire_and_forget: bool,
    ) {
        if fire_and_forget {
            shared.finish(CommandStatus::Failed);
            for &(pid, uid) in &shared.uids {
                self.uid_pool.release(command_id, pid, uid);
            }
            self.exclusion.release(command_id, &shared.scope());
        } else {
            shared.transport_error.store(true, Ordering::Relaxed);
            self.finalize(shared, CommandStatus::Failed);
        }
    }

    // ------------------------------------------------------------------
    // 解复用
    // ------------------------------------------------------------------

    /// 处理一帧入站数据（解复用线程专用，定位器状态的唯一写者）
    fn handle_frame(&self, tagged: TaggedFrame) {
        let fields = self.layout.decode(tagged.frame.id);

        if fields.command_id == 0 {
            warn!(
                arbitration_id = tagged.frame.id,
                "frame with command_id=0 received, ignoring"
            );
            return;
        }

        let command = match CommandId::from_u8(fields.command_id) {
            Some(command) => command,
            None => {
                debug!(
                    command_id = fields.command_id,
                    positioner_id = fields.positioner_id,
                    "reply with unregistered opcode, dropped"
                );
                return;
            }
        };

        // 碰撞通知优先于一切回复处理
        if command == CommandId::CollisionDetected {
            error!(
                positioner_id = fields.positioner_id,
                "collision reported by firmware"
            );
            let _ = self
                .events_tx
                .send(SchedulerEvent::CollisionDetected(fields.positioner_id));
            return;
        }

        // 路由学习：每个定位器的第一条回复确定其接口/总线
        {
            let routes = self.routes.upgradable_read();
            if !routes.contains_key(&fields.positioner_id) {
                let mut routes = parking_lot::RwLockUpgradableReadGuard::upgrade(routes);
                routes.insert(fields.positioner_id, (tagged.interface, tagged.bus));
            }
        }

        let reply = Reply {
            positioner_id: fields.positioner_id,
            uid: fields.uid,
            response_code: ResponseCode::from_u8(fields.response_code),
            data: tagged.frame.data,
            len: tagged.frame.len,
            interface: tagged.interface,
            bus: tagged.bus,
        };

        // 状态 / 位置旁路：单写者直接落到定位器银行
        if reply.response_code.is_accepted() {
            match command {
                CommandId::GetFirmwareVersion => {
                    if let Ok(firmware) = decode_firmware(reply.data_slice()) {
                        self.bank.set_firmware(reply.positioner_id, firmware);
                    }
                }
                CommandId::GetStatus => {
                    if let Ok(raw) = decode_status(reply.data_slice()) {
                        let change = self.bank.apply_status(reply.positioner_id, raw);
                        if change.changed {
                            let _ = self.events_tx.send(SchedulerEvent::StatusChanged {
                                positioner_id: reply.positioner_id,
                                raw,
                                collided: change.collided,
                            });
                        }
                    }
                }
                CommandId::GetActualPosition => {
                    if let Ok((alpha, beta)) = decode_position(reply.data_slice(), self.motor_steps)
                    {
                        self.bank.set_position(reply.positioner_id, alpha, beta);
                    }
                }
                _ => {}
            }
        }

        // 回复路由：先查单播键，再查广播键
        let shared = {
            let running = self.running.lock();
            running
                .get(&running_key(fields.positioner_id, fields.command_id, fields.uid))
                .or_else(|| running.get(&running_key(BROADCAST_ID, fields.command_id, fields.uid)))
                .cloned()
        };

        let Some(shared) = shared else {
            debug!(
                command = command.name(),
                positioner_id = fields.positioner_id,
                uid = fields.uid,
                "no matching running command for reply"
            );
            return;
        };

        if let ReplyOutcome::Terminal(status) = shared.process_reply(reply) {
            self.finalize(&shared, status);
        }
    }

    /// 接口故障：在途命令全部标记传输失败
    fn handle_interface_down(&self, interface: usize) {
        let affected: Vec<Arc<CommandShared>> = {
            let running = self.running.lock();
            running
                .values()
                .filter(|shared| shared.interfaces.contains(&interface))
                .cloned()
                .collect()
        };

        if !affected.is_empty() {
            warn!(
                interface = %self.interfaces[interface].name,
                commands = affected.len(),
                "interface down, failing in-flight commands"
            );
        }
        for shared in affected {
            shared.transport_error.store(true, Ordering::Relaxed);
            self.finalize(&shared, CommandStatus::Failed);
        }

        let _ = self.events_tx.send(SchedulerEvent::TransportError(interface));
    }
}

// ============================================================================
// IO 线程
// ============================================================================

fn io_loop(
    mut adapter: Box<dyn BusAdapter>,
    index: usize,
    cmd_rx: Receiver<Outbound>,
    demux_tx: Sender<DemuxMsg>,
    alive: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = RECONNECT_BACKOFF_MIN;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        // --- 重连路径 ---
        if !alive.load(Ordering::Acquire) {
            // 断线期间丢弃待发帧（对应命令已标记失败）
            while cmd_rx.try_recv().is_ok() {}

            std::thread::sleep(backoff);
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match adapter.reconnect() {
                Ok(()) => {
                    info!(interface = adapter.name(), "interface reconnected");
                    alive.store(true, Ordering::Release);
                    backoff = RECONNECT_BACKOFF_MIN;
                    let _ = demux_tx.send(DemuxMsg::InterfaceUp(index));
                }
                Err(e) => {
                    trace!(interface = adapter.name(), error = %e, "reconnect attempt failed");
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
            }
            continue;
        }

        // --- 接收 ---
        match adapter.recv(RECV_TIMEOUT) {
            Ok(Some((frame, bus))) => {
                let _ = demux_tx.send(DemuxMsg::Frame(TaggedFrame {
                    frame,
                    interface: index,
                    bus,
                }));
            }
            Ok(None) => {}
            Err(e) if e.is_disconnection() => {
                error!(interface = adapter.name(), error = %e, "interface receive failed");
                alive.store(false, Ordering::Release);
                let _ = demux_tx.send(DemuxMsg::InterfaceDown(index));
                continue;
            }
            Err(e) => {
                warn!(interface = adapter.name(), error = %e, "receive error, ignoring frame");
            }
        }

        // --- 发送（非阻塞排空，绝不阻塞接收路径） ---
        while let Ok(outbound) = cmd_rx.try_recv() {
            if let Err(e) = adapter.send(&outbound.frame, outbound.bus) {
                error!(interface = adapter.name(), error = %e, "interface write failed");
                if e.is_disconnection() {
                    alive.store(false, Ordering::Release);
                    let _ = demux_tx.send(DemuxMsg::InterfaceDown(index));
                }
                break;
            }
        }
    }

    debug!(interface = adapter.name(), "io thread exited");
}

// ============================================================================
// 对外封装
// ============================================================================

/// CAN 调度器
///
/// 拥有接口 IO 线程与解复用线程；`Drop` 时自动关停。
pub struct CanScheduler {
    core: Arc<SchedulerCore>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    events_rx: Mutex<Option<Receiver<SchedulerEvent>>>,
}

impl CanScheduler {
    /// 启动调度器并接管给定的总线适配器
    pub fn new(
        adapters: Vec<Box<dyn BusAdapter>>,
        layout: IdentifierLayout,
        motor_steps: i64,
        bank: Arc<PositionerBank>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        let (demux_tx, demux_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut interfaces = Vec::new();
        let mut pending_io = Vec::new();
        for adapter in adapters {
            let (cmd_tx, cmd_rx) = bounded(OUTBOUND_BACKLOG);
            let alive = Arc::new(AtomicBool::new(true));
            interfaces.push(InterfaceHandle {
                name: adapter.name().to_string(),
                cmd_tx,
                alive: Arc::clone(&alive),
            });
            pending_io.push((adapter, cmd_rx, alive));
        }

        let core = Arc::new(SchedulerCore {
            layout,
            motor_steps,
            uid_pool: UidPool::new(layout.uid_pool_size()),
            exclusion: Exclusion::new(),
            running: Mutex::new(HashMap::new()),
            interfaces,
            routes: RwLock::new(HashMap::new()),
            bank,
            events_tx,
            shutdown: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        for (index, (adapter, cmd_rx, alive)) in pending_io.into_iter().enumerate() {
            let demux_tx = demux_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("fps-io-{}", index))
                    .spawn(move || io_loop(adapter, index, cmd_rx, demux_tx, alive, shutdown))
                    .expect("failed to spawn io thread"),
            );
        }
        drop(demux_tx);

        {
            let core = Arc::clone(&core);
            threads.push(
                std::thread::Builder::new()
                    .name("fps-demux".to_string())
                    .spawn(move || {
                        for msg in demux_rx {
                            match msg {
                                DemuxMsg::Frame(tagged) => core.handle_frame(tagged),
                                DemuxMsg::InterfaceDown(idx) => core.handle_interface_down(idx),
                                DemuxMsg::InterfaceUp(idx) => {
                                    let _ = core.events_tx.send(SchedulerEvent::TransportReset(idx));
                                }
                            }
                        }
                        debug!("demux thread exited");
                    })
                    .expect("failed to spawn demux thread"),
            );
        }

        Self {
            core,
            shutdown,
            threads: Mutex::new(threads),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// 取走事件接收端（只允许一个消费者）
    pub fn take_events(&self) -> Option<Receiver<SchedulerEvent>> {
        self.events_rx.lock().take()
    }

    /// 提交命令
    pub fn submit(&self, command: Command) -> Result<CommandHandle> {
        SchedulerCore::submit(&self.core, command)
    }

    /// 取消所有非安全在途命令
    pub fn cancel_non_safe(&self) {
        SchedulerCore::cancel_non_safe(&self.core);
    }

    /// 取消所有在途运动命令
    pub fn cancel_moves(&self) {
        SchedulerCore::cancel_moves(&self.core);
    }

    /// 查询定位器路由
    pub fn route_for(&self, positioner_id: u16) -> Option<(usize, usize)> {
        self.core.routes.read().get(&positioner_id).copied()
    }

    /// 清空路由表（重新初始化时使用）
    pub fn clear_routes(&self) {
        self.core.routes.write().clear();
    }

    /// 各接口的存活状态
    pub fn interfaces_alive(&self) -> Vec<bool> {
        self.core
            .interfaces
            .iter()
            .map(|i| i.alive.load(Ordering::Acquire))
            .collect()
    }

    /// 关停调度器（幂等）
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.shutdown.store(true, Ordering::Release);

        // 把仍在途的命令标记取消
        let in_flight: Vec<Arc<CommandShared>> =
            self.core.running.lock().values().cloned().collect();
        for shared in in_flight {
            self.core.finalize(&shared, CommandStatus::Cancelled);
        }

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        info!("scheduler shut down");
    }
}

impl Drop for CanScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_pool_lowest_free_first() {
        let pool = UidPool::new(63);
        assert_eq!(pool.allocate(3, 4), Some(1));
        assert_eq!(pool.allocate(3, 4), Some(2));
        pool.release(3, 4, 1);
        assert_eq!(pool.allocate(3, 4), Some(1));
        assert_eq!(pool.in_use(3, 4), 2);
    }

    #[test]
    fn test_uid_pool_is_per_key() {
        let pool = UidPool::new(63);
        assert_eq!(pool.allocate(3, 4), Some(1));
        assert_eq!(pool.allocate(3, 5), Some(1));
        assert_eq!(pool.allocate(2, 4), Some(1));
    }

    #[test]
    fn test_uid_pool_exhaustion() {
        let pool = UidPool::new(2);
        assert_eq!(pool.allocate(1, 1), Some(1));
        assert_eq!(pool.allocate(1, 1), Some(2));
        assert_eq!(pool.allocate(1, 1), None);
        pool.release(1, 1, 2);
        assert_eq!(pool.allocate(1, 1), Some(2));
    }

    #[test]
    fn test_exclusion_same_key_blocks() {
        use std::sync::atomic::AtomicUsize;

        let exclusion = Arc::new(Exclusion::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let exclusion = Arc::clone(&exclusion);
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(std::thread::spawn(move || {
                for _ in 0..20 {
                    exclusion.acquire(3, &[4]);
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(50));
                    counter.fetch_sub(1, Ordering::SeqCst);
                    exclusion.release(3, &[4]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // 同一 (command_id, positioner_id) 永远只有一个持有者
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exclusion_broadcast_blocks_unicast() {
        let exclusion = Arc::new(Exclusion::new());

        exclusion.acquire(3, &[BROADCAST_ID]);

        let exclusion2 = Arc::clone(&exclusion);
        let handle = std::thread::spawn(move || {
            exclusion2.acquire(3, &[7]);
            exclusion2.release(3, &[7]);
        });

        // 广播持有期间单播必须等待
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        exclusion.release(3, &[BROADCAST_ID]);
        handle.join().unwrap();
    }

    #[test]
    fn test_exclusion_unicast_blocks_broadcast() {
        let exclusion = Arc::new(Exclusion::new());

        exclusion.acquire(3, &[7]);

        let exclusion2 = Arc::clone(&exclusion);
        let handle = std::thread::spawn(move || {
            exclusion2.acquire(3, &[BROADCAST_ID]);
            exclusion2.release(3, &[BROADCAST_ID]);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        exclusion.release(3, &[7]);
        handle.join().unwrap();
    }

    #[test]
    fn test_exclusion_different_keys_are_independent() {
        let exclusion = Exclusion::new();
        exclusion.acquire(3, &[4]);
        // 不同定位器、不同命令号互不阻塞
        exclusion.acquire(3, &[5]);
        exclusion.acquire(2, &[4]);
        exclusion.release(3, &[4]);
        exclusion.release(3, &[5]);
        exclusion.release(2, &[4]);
    }

    #[test]
    fn test_running_key_is_injective() {
        let mut seen = HashSet::new();
        for pid in [0u16, 1, 4, 500, 2047] {
            for cid in [1u8, 3, 14, 201] {
                for uid in [0u8, 1, 63] {
                    assert!(seen.insert(running_key(pid, cid, uid)));
                }
            }
        }
    }
}
