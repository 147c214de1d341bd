//! FPS 协调器
//!
//! `Fps` 是整个机群的值对象：拥有调度器、接口与定位器表，
//! 不存在进程级可变全局（单实例锁文件除外）。职责：
//!
//! - 发现：广播固件版本 / 状态构建定位器表与总线路由
//! - 轮询：状态与位置两个后台任务，状态轮询是碰撞事件的来源
//! - 安全：碰撞即上锁（取消非安全在途命令并广播轨迹中止），
//!   锁定期间只允许安全命令；禁用 / 离线定位器不出现在
//!   任何非安全命令里
//! - 操作面：`goto` / `send_trajectory` / `abort` / `lock` / `unlock` /
//!   `enable` / `disable`，以及事件订阅

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::can::BusAdapter;
use crate::command::Command;
use crate::config::{FpsConfig, InterfaceKind};
use crate::error::{FpsError, Result};
use crate::events::{EventBus, FpsEvent, FpsRequest, FpsResponse};
use crate::positioner::{Positioner, PositionerBank};
use crate::protocol::commands::{decode_firmware, encode_speed, CommandId};
use crate::scheduler::{CanScheduler, CommandHandle, SchedulerEvent};
use crate::singleton::InstanceLock;
use crate::trajectory::{self, TrajectoryData, ABORT_COOLDOWN};

/// 轮询线程检查停止标志的粒度
const POLL_SLICE: Duration = Duration::from_millis(50);

/// 机群快照状态
#[derive(Debug, Clone, Default)]
pub struct FpsState {
    /// 碰撞后锁定，只允许安全命令
    pub locked: bool,
    /// 触发锁定的定位器
    pub locked_by: Vec<u16>,
    /// 任一非禁用定位器在运动
    pub moving: bool,
    /// 累计执行的轨迹数
    pub trajectories_executed: u64,
    /// 最近一次状态刷新的时刻
    pub last_status: Option<SystemTime>,
}

struct FpsInner {
    config: FpsConfig,
    scheduler: CanScheduler,
    bank: Arc<PositionerBank>,
    state: ArcSwap<FpsState>,
    events: EventBus,
    pollers_paused: AtomicBool,
    pollers_started: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    initialised: AtomicBool,
    shut_down: AtomicBool,
    _instance_lock: Option<InstanceLock>,
}

impl Drop for FpsInner {
    fn drop(&mut self) {
        // 后台线程都持 Weak，置位后自行退出；调度器在成员析构时关停
        self.stop.store(true, Ordering::Release);
    }
}

/// 机群协调器（可克隆句柄）
#[derive(Clone)]
pub struct Fps {
    inner: Arc<FpsInner>,
}

impl Fps {
    /// 按配置档案建立接口并创建 FPS
    pub fn new(config: FpsConfig) -> Result<Self> {
        let adapters = build_adapters(&config)?;
        Self::with_adapters(config, adapters)
    }

    /// 用外部适配器创建 FPS（测试用虚拟总线走这里）
    pub fn with_adapters(config: FpsConfig, adapters: Vec<Box<dyn BusAdapter>>) -> Result<Self> {
        config.validate()?;

        let instance_lock = match &config.lockfile {
            Some(path) => Some(InstanceLock::acquire(path)?),
            None => None,
        };

        let bank = Arc::new(PositionerBank::new());
        let scheduler = CanScheduler::new(
            adapters,
            config.positioner.identifier,
            config.positioner.motor_steps,
            Arc::clone(&bank),
        );

        let fps = Self {
            inner: Arc::new(FpsInner {
                config,
                scheduler,
                bank,
                state: ArcSwap::from_pointee(FpsState::default()),
                events: EventBus::new(),
                pollers_paused: AtomicBool::new(false),
                pollers_started: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
                stop: Arc::new(AtomicBool::new(false)),
                initialised: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                _instance_lock: instance_lock,
            }),
        };
        fps.spawn_event_thread();
        Ok(fps)
    }

    // ------------------------------------------------------------------
    // 访问器
    // ------------------------------------------------------------------

    pub fn config(&self) -> &FpsConfig {
        &self.inner.config
    }

    /// 机群状态快照
    pub fn state(&self) -> Arc<FpsState> {
        self.inner.state.load_full()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.load().locked
    }

    pub fn locked_by(&self) -> Vec<u16> {
        self.inner.state.load().locked_by.clone()
    }

    pub fn is_initialised(&self) -> bool {
        self.inner.initialised.load(Ordering::Acquire)
    }

    /// 任一定位器在运动
    pub fn is_moving(&self) -> bool {
        self.inner.bank.any_moving()
    }

    /// 全部定位器快照
    pub fn positioners(&self) -> Vec<Positioner> {
        self.inner.bank.snapshot()
    }

    /// 单台定位器快照
    pub fn positioner(&self, id: u16) -> Option<Positioner> {
        self.inner.bank.get(id)
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> Receiver<FpsEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn bank(&self) -> &PositionerBank {
        &self.inner.bank
    }

    pub(crate) fn publish(&self, event: FpsEvent) {
        self.inner.events.publish(event);
    }

    pub(crate) fn set_pollers_paused(&self, paused: bool) {
        self.inner.pollers_paused.store(paused, Ordering::Release);
    }

    pub(crate) fn note_trajectories_executed(&self, positioner_ids: &[u16]) {
        self.inner.state.rcu(|old| {
            let mut state = (**old).clone();
            state.trajectories_executed += 1;
            Arc::new(state)
        });
        for &pid in positioner_ids {
            self.inner.bank.update(pid, |p| p.trajectories += 1);
        }
    }

    // ------------------------------------------------------------------
    // 初始化与发现
    // ------------------------------------------------------------------

    /// 初始化机群：发现、建路由、停残余运动、配默认速度、起轮询
    ///
    /// `disabled` 是粘性标志，重复初始化后保留。
    pub fn initialise(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(FpsError::ShutDown);
        }
        info!("initialising FPS");
        self.set_pollers_paused(true);

        // 粘性禁用集合：既有标志 + 配置列表
        let mut sticky_disabled: Vec<u16> = self
            .inner
            .bank
            .snapshot()
            .iter()
            .filter(|p| p.flags.disabled)
            .map(|p| p.id)
            .collect();
        sticky_disabled.extend(&self.inner.config.disabled_positioners);

        self.inner.bank.clear();
        self.inner.scheduler.clear_routes();

        // --- 发现：广播固件版本 ---
        let timeout = self.inner.config.initialise_timeout();
        let result = self
            .inner
            .scheduler
            .submit(Command::broadcast(CommandId::GetFirmwareVersion).with_timeout(timeout))?
            .wait();

        if result.replies.is_empty() {
            warn!("no positioners found during discovery");
            self.inner.initialised.store(true, Ordering::Release);
            self.publish(FpsEvent::DiscoveryComplete { found: Vec::new() });
            self.set_pollers_paused(false);
            return Ok(());
        }

        for reply in &result.replies {
            let pid = reply.positioner_id;
            if self.inner.bank.contains(pid) {
                continue;
            }
            let mut positioner = Positioner::new(pid);
            if let Ok(firmware) = decode_firmware(reply.data_slice()) {
                positioner.firmware = Some(firmware);
                positioner.flags.bootloader = firmware.is_bootloader();
            }
            // 首条回复确定接口/总线映射
            if let Some((interface, bus)) = self.inner.scheduler.route_for(pid) {
                positioner.interface = Some(interface);
                positioner.bus = Some(bus);
            }
            self.inner.bank.insert(positioner);
            self.publish(FpsEvent::PositionerAdded { positioner_id: pid });
        }

        // --- 禁用 / 离线配置 ---
        for pid in sticky_disabled {
            self.inner.bank.update(pid, |p| p.flags.disabled = true);
        }
        for (&pid, &(alpha, beta)) in &self.inner.config.offline_positioners {
            if !self.inner.bank.contains(pid) {
                self.inner.bank.insert(Positioner::new(pid));
            }
            self.inner.bank.update(pid, |p| {
                p.flags.disabled = true;
                p.flags.offline = true;
                p.alpha = Some(alpha);
                p.beta = Some(beta);
            });
        }

        let found = self.inner.bank.ids();
        info!(count = found.len(), positioners = ?found, "connected positioners");

        // --- GET_ID：确认定位器-总线映射（多接口/多总线时才有实际作用）---
        let responsive = self
            .inner
            .bank
            .snapshot()
            .iter()
            .filter(|p| !p.flags.offline)
            .count();
        if responsive > 0 {
            let id_scan = self
                .inner
                .scheduler
                .submit(
                    Command::broadcast(CommandId::GetId)
                        .with_timeout(timeout)
                        .with_expected_replies(responsive),
                )?
                .wait();
            for reply in &id_scan.replies {
                let route = self.inner.scheduler.route_for(reply.positioner_id);
                self.inner.bank.update(reply.positioner_id, |p| {
                    p.interface = route.map(|(interface, _)| interface);
                    p.bus = route.map(|(_, bus)| bus);
                });
            }
        }

        // --- 状态广播 ---
        self.update_status()?;

        // --- 停掉残余运动（abort，不清碰撞标志）---
        let fleet_bootloader = self
            .inner
            .bank
            .snapshot()
            .iter()
            .any(|p| !p.flags.offline && p.is_bootloader());
        if !fleet_bootloader {
            self.stop_trajectory(false)?;
        }

        // --- 每台初始化：默认速度 + 初始位置（bootloader 跳过运动相关步骤）---
        let active: Vec<u16> = self
            .inner
            .bank
            .snapshot()
            .iter()
            .filter(|p| !p.flags.disabled && !p.flags.offline && !p.is_bootloader())
            .map(|p| p.id)
            .collect();

        if !active.is_empty() {
            let speed = self.inner.config.positioner.motor_speed;
            let result = self
                .send_command(
                    Command::new(CommandId::SetSpeed, active.clone())
                        .with_payload(encode_speed(speed, speed).to_vec()),
                )?
                .wait();
            if result.succeeded() {
                for &pid in &active {
                    self.inner.bank.update(pid, |p| p.speed = Some((speed, speed)));
                }
            } else {
                warn!(status = ?result.status, "failed setting default speeds");
            }

            let result = self
                .send_command(Command::new(CommandId::GetActualPosition, active.clone()))?
                .wait();
            if !result.succeeded() {
                warn!(status = ?result.status, "failed reading initial positions");
            }

            for &pid in &active {
                self.inner.bank.update(pid, |p| p.flags.initialised = true);
            }
        }

        self.inner.initialised.store(true, Ordering::Release);

        // --- 碰撞检查：带着碰撞上电的机群直接锁定 ---
        let collided = self.inner.bank.collided_ids();
        if !collided.is_empty() {
            warn!(positioners = ?collided, "FPS was collided at startup, locking");
            self.lock(collided)?;
        }

        if self.inner.config.safe_mode.enabled {
            warn!(
                min_beta = self.inner.config.safe_mode.min_beta,
                "safe mode enabled"
            );
        }

        self.publish(FpsEvent::DiscoveryComplete { found });

        if self.inner.config.poller.start_pollers && !fleet_bootloader {
            self.start_pollers();
        }
        self.set_pollers_paused(false);
        Ok(())
    }

    /// 手工登记单台定位器（发现之外的补充途径）
    pub fn add_positioner(&self, positioner_id: u16, interface: Option<usize>, bus: Option<usize>) {
        let mut positioner = Positioner::new(positioner_id);
        positioner.interface = interface;
        positioner.bus = bus;
        self.inner.bank.insert(positioner);
        self.publish(FpsEvent::PositionerAdded { positioner_id });
    }

    // ------------------------------------------------------------------
    // 命令入口
    // ------------------------------------------------------------------

    /// 提交一条命令（带安全门控）
    ///
    /// - 锁定状态只放行安全命令，其余同步返回 `Locked`
    /// - 非安全命令不允许指向禁用 / 离线定位器
    /// - bootloader 模式只放行 bootloader 兼容命令
    /// - 机群运动中拒绝新的运动命令
    pub fn send_command(&self, command: Command) -> Result<CommandHandle> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(FpsError::ShutDown);
        }

        let spec = command.command_id.spec();
        {
            let state = self.inner.state.load();
            if state.locked && !spec.safe {
                debug!(
                    command = command.command_id.name(),
                    "rejected: FPS is locked"
                );
                return Err(FpsError::Locked(state.locked_by.clone()));
            }
        }

        if command.is_broadcast() {
            // 广播对禁用定位器"静默豁免"：帧在总线上所有节点都听得到，
            // 门控无从阻止，回复按到达处理
        } else {
            for &pid in &command.positioner_ids {
                let positioner = self
                    .inner
                    .bank
                    .get(pid)
                    .ok_or(FpsError::UnknownPositioner(pid))?;
                if !spec.safe && (positioner.flags.disabled || positioner.flags.offline) {
                    return Err(FpsError::PositionerDisabled(pid));
                }
                if positioner.is_bootloader() && !spec.bootloader {
                    return Err(FpsError::Bootloader(pid));
                }
            }
        }

        if spec.move_command && self.inner.bank.any_moving() {
            return Err(FpsError::Moving);
        }

        self.inner.scheduler.submit(command)
    }

    // ------------------------------------------------------------------
    // 状态 / 位置刷新
    // ------------------------------------------------------------------

    /// 广播刷新全体状态（超时自动重试一次）
    ///
    /// 返回是否收到了预期数量的回复。
    pub fn update_status(&self) -> Result<bool> {
        let expected = self
            .inner
            .bank
            .snapshot()
            .iter()
            .filter(|p| !p.flags.offline)
            .count();
        if expected == 0 {
            return Ok(true);
        }

        let mut result = self
            .send_command(
                Command::broadcast(CommandId::GetStatus)
                    .with_timeout(Duration::from_secs(1))
                    .with_expected_replies(expected),
            )?
            .wait();

        if result.status.timed_out() {
            warn!("GET_STATUS timed out, retrying");
            result = self
                .send_command(
                    Command::broadcast(CommandId::GetStatus)
                        .with_timeout(Duration::from_secs(1))
                        .with_expected_replies(expected),
                )?
                .wait();
        }

        let moving = self.inner.bank.any_moving();
        self.inner.state.rcu(|old| {
            let mut state = (**old).clone();
            state.moving = moving;
            state.last_status = Some(SystemTime::now());
            Arc::new(state)
        });

        Ok(result.succeeded())
    }

    /// 刷新已初始化定位器的位置（超时自动重试一次）
    pub fn update_position(&self) -> Result<bool> {
        let pids: Vec<u16> = self
            .inner
            .bank
            .snapshot()
            .iter()
            .filter(|p| {
                p.flags.initialised && !p.flags.disabled && !p.flags.offline && !p.is_bootloader()
            })
            .map(|p| p.id)
            .collect();
        if pids.is_empty() {
            return Ok(true);
        }

        let mut result = self
            .send_command(
                Command::new(CommandId::GetActualPosition, pids.clone())
                    .with_timeout(Duration::from_secs(1)),
            )?
            .wait();

        if result.status.timed_out() {
            warn!("GET_ACTUAL_POSITION timed out, retrying");
            result = self
                .send_command(
                    Command::new(CommandId::GetActualPosition, pids)
                        .with_timeout(Duration::from_secs(1)),
                )?
                .wait();
        }

        Ok(result.succeeded())
    }

    // ------------------------------------------------------------------
    // 运动
    // ------------------------------------------------------------------

    /// 把一组定位器送到目标角度
    ///
    /// 生成遵守速度界限的两点轨迹并交给轨迹引擎。起始角不做
    /// [0, 360) 裁剪，负角是合法输入。
    pub fn goto(&self, targets: HashMap<u16, (f64, f64)>, speed: Option<f64>) -> Result<()> {
        if self.is_locked() {
            return Err(FpsError::Locked(self.locked_by()));
        }
        if self.inner.bank.any_moving() {
            return Err(FpsError::Moving);
        }

        let speed = speed.unwrap_or(self.inner.config.positioner.motor_speed);
        if !(500.0..=5000.0).contains(&speed) {
            return Err(FpsError::InvalidConfiguration(format!(
                "goto speed must be within 500..=5000 RPM, got {}",
                speed
            )));
        }

        for &pid in targets.keys() {
            if !self.inner.bank.contains(pid) {
                return Err(FpsError::UnknownPositioner(pid));
            }
        }

        self.update_position()?;

        let ratio = self.inner.config.positioner.reduction_ratio;
        let mut data = TrajectoryData::new();
        for (&pid, &(alpha_end, beta_end)) in &targets {
            let positioner = self
                .inner
                .bank
                .get(pid)
                .ok_or(FpsError::UnknownPositioner(pid))?;
            let (alpha0, beta0) = positioner.position().ok_or_else(|| {
                FpsError::InvalidConfiguration(format!(
                    "positioner {} does not know its position",
                    pid
                ))
            })?;

            let alpha_time = crate::protocol::goto_move_time(alpha_end - alpha0, speed, ratio);
            let beta_time = crate::protocol::goto_move_time(beta_end - beta0, speed, ratio);

            data.insert(
                pid,
                vec![(alpha0, 0.1), (alpha_end, alpha_time + 0.1)],
                vec![(beta0, 0.1), (beta_end, beta_time + 0.1)],
            );
        }

        let outcome = self.send_trajectory(data);
        // 无论成败都把状态与位置刷新到最新
        let _ = self.update_status();
        let _ = self.update_position();
        outcome
    }

    /// 发送并执行一条多定位器轨迹
    pub fn send_trajectory(&self, data: TrajectoryData) -> Result<()> {
        trajectory::run(self, data)
    }

    /// 停掉全部运动
    ///
    /// `clear_flags = false` 广播 `SEND_TRAJECTORY_ABORT`（保留碰撞
    /// 标志位）；`true` 广播 `STOP_TRAJECTORY`（清标志位，显式操作）。
    /// 同时取消在途的运动命令，并留出冷却时间。
    pub fn stop_trajectory(&self, clear_flags: bool) -> Result<()> {
        let command_id = if clear_flags {
            CommandId::StopTrajectory
        } else {
            CommandId::SendTrajectoryAbort
        };

        self.send_command(Command::broadcast(command_id).with_timeout(Duration::ZERO))?;
        self.inner.scheduler.cancel_moves();

        // timeout=0 不等回复；立刻跟进其他命令会让固件丢帧
        std::thread::sleep(ABORT_COOLDOWN);
        Ok(())
    }

    /// 中止全部运动（`stop_trajectory(false)` 的别名）
    pub fn abort(&self) -> Result<()> {
        self.stop_trajectory(false)
    }

    // ------------------------------------------------------------------
    // 锁定
    // ------------------------------------------------------------------

    /// 锁定机群：取消非安全在途命令并广播轨迹中止
    ///
    /// 锁保持到操作员显式 `unlock`。
    pub fn lock(&self, by: Vec<u16>) -> Result<()> {
        let already_locked = self.is_locked();
        self.inner.state.rcu(|old| {
            let mut state = (**old).clone();
            state.locked = true;
            for &pid in &by {
                if !state.locked_by.contains(&pid) {
                    state.locked_by.push(pid);
                }
            }
            Arc::new(state)
        });

        if !already_locked {
            error!(locked_by = ?self.locked_by(), "locking the FPS");
        }

        self.inner.scheduler.cancel_non_safe();
        self.stop_trajectory(false)?;
        let _ = self.update_status();

        self.publish(FpsEvent::Locked {
            locked_by: self.locked_by(),
        });
        Ok(())
    }

    /// 解锁机群
    ///
    /// 先广播 `STOP_TRAJECTORY` 清掉固件侧碰撞标志位再检查；
    /// 仍有定位器报碰撞时拒绝解锁。
    pub fn unlock(&self) -> Result<()> {
        self.stop_trajectory(true)?;
        self.update_status()?;

        let still_collided = self.inner.bank.collided_ids();
        if !still_collided.is_empty() {
            return Err(FpsError::Locked(still_collided));
        }

        self.inner.state.rcu(|old| {
            let mut state = (**old).clone();
            state.locked = false;
            state.locked_by.clear();
            Arc::new(state)
        });
        info!("FPS unlocked");
        self.publish(FpsEvent::Unlocked);
        Ok(())
    }

    // ------------------------------------------------------------------
    // 启用 / 禁用
    // ------------------------------------------------------------------

    /// 禁用定位器（粘性，重新初始化后保留）
    pub fn disable(&self, positioner_id: u16) -> Result<()> {
        if !self.inner.bank.update(positioner_id, |p| p.flags.disabled = true) {
            return Err(FpsError::UnknownPositioner(positioner_id));
        }
        info!(positioner_id, "positioner disabled");
        Ok(())
    }

    /// 重新启用定位器
    pub fn enable(&self, positioner_id: u16) -> Result<()> {
        if !self.inner.bank.update(positioner_id, |p| p.flags.disabled = false) {
            return Err(FpsError::UnknownPositioner(positioner_id));
        }
        info!(positioner_id, "positioner enabled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // 操作请求分发
    // ------------------------------------------------------------------

    /// 处理一条操作请求
    pub fn handle_request(&self, request: FpsRequest) -> Result<FpsResponse> {
        match request {
            FpsRequest::Goto { targets, speed } => {
                self.goto(targets, speed)?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::SendTrajectory(data) => {
                self.send_trajectory(data)?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::Abort => {
                self.abort()?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::Lock => {
                self.lock(Vec::new())?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::Unlock => {
                self.unlock()?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::Enable(pid) => {
                self.enable(pid)?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::Disable(pid) => {
                self.disable(pid)?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::Reload => {
                self.initialise()?;
                Ok(FpsResponse::Ok)
            }
            FpsRequest::GetStatus => {
                let state = self.state();
                Ok(FpsResponse::Status {
                    locked: state.locked,
                    locked_by: state.locked_by.clone(),
                    moving: state.moving,
                    n_positioners: self.inner.bank.len(),
                    trajectories_executed: state.trajectories_executed,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // 关停
    // ------------------------------------------------------------------

    /// 关停机群控制（幂等；第二次调用不再发出任何帧）
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down FPS");

        // 尽力停住机群再撤掉调度器
        let _ = self
            .inner
            .scheduler
            .submit(Command::broadcast(CommandId::SendTrajectoryAbort).with_timeout(Duration::ZERO));

        self.inner.stop.store(true, Ordering::Release);
        self.inner.scheduler.shutdown();

        for handle in self.inner.threads.lock().drain(..) {
            let _ = handle.join();
        }
        info!("FPS shut down");
    }

    // ------------------------------------------------------------------
    // 后台线程
    // ------------------------------------------------------------------

    fn spawn_event_thread(&self) {
        let Some(events) = self.inner.scheduler.take_events() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let stop = Arc::clone(&self.inner.stop);

        let handle = std::thread::Builder::new()
            .name("fps-events".to_string())
            .spawn(move || loop {
                match events.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        let fps = Fps { inner };
                        fps.dispatch_scheduler_event(event);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::Acquire) || weak.upgrade().is_none() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("failed to spawn event thread");
        self.inner.threads.lock().push(handle);
    }

    fn dispatch_scheduler_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::StatusChanged {
                positioner_id,
                raw,
                collided,
            } => {
                self.publish(FpsEvent::StatusChanged { positioner_id, raw });
                if collided && !self.is_locked() {
                    error!(positioner_id, "collision observed in status, locking the FPS");
                    if let Err(e) = self.lock(vec![positioner_id]) {
                        error!(error = %e, "failed to lock the FPS after collision");
                    }
                }
            }
            SchedulerEvent::CollisionDetected(positioner_id) => {
                // 锁定过程中 stop 会让更多定位器上报碰撞，已锁定时忽略
                if !self.is_locked() {
                    error!(positioner_id, "collision reported, locking the FPS");
                    if let Err(e) = self.lock(vec![positioner_id]) {
                        error!(error = %e, "failed to lock the FPS after collision");
                    }
                }
            }
            SchedulerEvent::TransportError(interface) => {
                self.publish(FpsEvent::Alert {
                    message: format!("CAN interface {} failed, reconnecting", interface),
                });
            }
            SchedulerEvent::TransportReset(interface) => {
                self.publish(FpsEvent::TransportReset { interface });
            }
        }
    }

    fn start_pollers(&self) {
        if self.inner.pollers_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let jobs: [(&str, Duration, fn(&Fps) -> Result<bool>); 2] = [
            (
                "fps-status-poller",
                self.inner.config.status_interval(),
                |fps| fps.update_status(),
            ),
            (
                "fps-position-poller",
                self.inner.config.position_interval(),
                |fps| fps.update_position(),
            ),
        ];

        for (name, interval, job) in jobs {
            let weak = Arc::downgrade(&self.inner);
            let stop = Arc::clone(&self.inner.stop);
            let poller_name = name.to_string();

            let handle = std::thread::Builder::new()
                .name(poller_name.clone())
                .spawn(move || loop {
                    // 分片睡眠，保持对停止信号的响应
                    let mut slept = Duration::ZERO;
                    while slept < interval {
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        let slice = POLL_SLICE.min(interval - slept);
                        std::thread::sleep(slice);
                        slept += slice;
                    }

                    let Some(inner) = weak.upgrade() else { return };
                    let fps = Fps { inner };
                    if fps.inner.pollers_paused.load(Ordering::Acquire) {
                        continue;
                    }

                    // update_* 内部已重试一次；仍失败就告警并继续轮询
                    match job(&fps) {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(poller = %poller_name, "poll incomplete");
                            fps.publish(FpsEvent::Alert {
                                message: format!("{} did not get all replies", poller_name),
                            });
                        }
                        Err(e) => {
                            debug!(poller = %poller_name, error = %e, "poll skipped");
                        }
                    }
                })
                .expect("failed to spawn poller thread");
            self.inner.threads.lock().push(handle);
        }
        debug!("pollers started");
    }
}

/// 按配置档案建立总线适配器
fn build_adapters(config: &FpsConfig) -> Result<Vec<Box<dyn BusAdapter>>> {
    let profile = &config.profile;
    let mut adapters: Vec<Box<dyn BusAdapter>> = Vec::new();

    match profile.interface {
        InterfaceKind::Virtual => {
            return Err(FpsError::InvalidConfiguration(
                "virtual profile has no channels; use Fps::with_adapters".into(),
            ));
        }
        InterfaceKind::Cannet => {
            for channel in &profile.channels {
                match crate::can::CanNetBus::open(
                    channel.clone(),
                    profile.port,
                    profile.bitrate,
                    profile.buses.clone(),
                ) {
                    Ok(adapter) => adapters.push(Box::new(adapter)),
                    Err(e) => warn!(channel = %channel, error = %e, "cannet connection failed"),
                }
            }
        }
        InterfaceKind::Slcan => {
            for channel in &profile.channels {
                match crate::can::SlcanBus::open(channel.clone(), profile.serial_baud, profile.bitrate)
                {
                    Ok(adapter) => adapters.push(Box::new(adapter)),
                    Err(e) => warn!(channel = %channel, error = %e, "slcan connection failed"),
                }
            }
        }
        InterfaceKind::Socketcan => {
            #[cfg(target_os = "linux")]
            for channel in &profile.channels {
                match crate::can::SocketCanBus::open(channel.clone()) {
                    Ok(adapter) => adapters.push(Box::new(adapter)),
                    Err(e) => warn!(channel = %channel, error = %e, "socketcan open failed"),
                }
            }
            #[cfg(not(target_os = "linux"))]
            return Err(FpsError::InvalidConfiguration(
                "socketcan is only available on Linux".into(),
            ));
        }
    }

    if adapters.is_empty() {
        return Err(FpsError::Can(crate::can::CanError::NotConnected));
    }
    Ok(adapters)
}
