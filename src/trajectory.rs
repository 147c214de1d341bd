//! 轨迹引擎
//!
//! 多定位器协同运动的分块上传协议：
//!
//! 1. `SEND_NEW_TRAJECTORY` 告知两轴样本数（逐定位器，要求全部接受）
//! 2. `SEND_TRAJECTORY_DATA` 分块传输样本（先 alpha 后 beta，
//!    同一块内的消息各用独立 UID）
//! 3. `TRAJECTORY_DATA_END` 结束传输；任何失败都会广播
//!    `SEND_TRAJECTORY_ABORT`，绝不留下半上传的轨迹
//! 4. 广播 `START_TRAJECTORY` 启动，随后轮询状态直到完成
//!
//! 中止一律用 `SEND_TRAJECTORY_ABORT`（保留碰撞标志位），而不是
//! `STOP_TRAJECTORY`（会清标志位）；中止后留 0.5 s 冷却再发后续命令。
//! 无论成败都会落一份诊断转储。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::{FpsError, Result};
use crate::events::FpsEvent;
use crate::fps::Fps;
use crate::protocol::commands::{
    encode_new_trajectory, encode_trajectory_point, CommandId,
};

/// 中止后的冷却时间
pub(crate) const ABORT_COOLDOWN: Duration = Duration::from_millis(500);

/// 超出预计时间多少秒算未到位
const MOVE_GRACE: f64 = 3.0;

// ============================================================================
// 轨迹数据
// ============================================================================

/// 单台定位器的两轴采样
///
/// 每个样本是 `(angle_deg, time_s)`，`time = 0` 为运动起点。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AxisSamples {
    pub alpha: Vec<(f64, f64)>,
    pub beta: Vec<(f64, f64)>,
}

/// 一次协同运动的轨迹集
///
/// 键是定位器 ID。可从等价形状的 JSON 文件解析，
/// 也可在内存中直接构造。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrajectoryData(pub BTreeMap<u16, AxisSamples>);

impl TrajectoryData {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 文件读取
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            FpsError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            FpsError::InvalidConfiguration(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// 插入一台定位器的轨迹
    pub fn insert(
        &mut self,
        positioner_id: u16,
        alpha: Vec<(f64, f64)>,
        beta: Vec<(f64, f64)>,
    ) -> &mut Self {
        self.0.insert(positioner_id, AxisSamples { alpha, beta });
        self
    }

    /// 涉及的定位器集合（轨迹的"指纹"）
    pub fn positioner_ids(&self) -> Vec<u16> {
        self.0.keys().copied().collect()
    }

    /// 全轨迹时长：所有样本时间的最大值
    pub fn move_time(&self) -> f64 {
        self.0
            .values()
            .flat_map(|axes| axes.alpha.iter().chain(axes.beta.iter()))
            .map(|&(_, t)| t)
            .fold(0.0f64, f64::max)
    }
}

// ============================================================================
// 失败分类
// ============================================================================

/// 逐定位器的轨迹失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrajectoryFailure {
    NotAcceptedNew,
    NotAcceptedData,
    NotAcceptedEnd,
    DidNotStart,
    DidNotReach,
    Collided,
    Aborted,
    InterfaceError,
}

/// 轨迹错误：消息加上逐定位器的失败原因表
#[derive(Debug, Clone)]
pub struct TrajectoryError {
    pub message: String,
    pub failed_positioners: HashMap<u16, TrajectoryFailure>,
}

impl std::error::Error for TrajectoryError {}

impl TrajectoryError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed_positioners: HashMap::new(),
        }
    }

    fn with_failures(
        message: impl Into<String>,
        failed_positioners: HashMap<u16, TrajectoryFailure>,
    ) -> Self {
        Self {
            message: message.into(),
            failed_positioners,
        }
    }
}

impl fmt::Display for TrajectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failed_positioners.is_empty() {
            write!(f, "trajectory failed: {}", self.message)
        } else {
            write!(
                f,
                "trajectory failed: {} ({:?})",
                self.message, self.failed_positioners
            )
        }
    }
}

// ============================================================================
// 诊断转储
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct TrajectoryDump {
    success: bool,
    start_time: Option<f64>,
    end_time: f64,
    move_time: f64,
    initial_positions: BTreeMap<u16, (f64, f64)>,
    final_positions: BTreeMap<u16, (f64, f64)>,
    failed_positioners: HashMap<u16, TrajectoryFailure>,
    trajectory: TrajectoryData,
}

// ============================================================================
// 引擎
// ============================================================================

/// 一次轨迹执行
pub(crate) struct Trajectory<'a> {
    fps: &'a Fps,
    data: TrajectoryData,
    /// 每台定位器的 `(n_alpha, n_beta)`
    n_points: BTreeMap<u16, (u32, u32)>,
    move_time: f64,
    failed: HashMap<u16, TrajectoryFailure>,
    start_time: Option<Instant>,
    start_stamp: Option<f64>,
    initial_positions: BTreeMap<u16, (f64, f64)>,
}

impl<'a> Trajectory<'a> {
    /// 校验并准备一次轨迹
    pub fn new(fps: &'a Fps, data: TrajectoryData) -> Result<Self> {
        if fps.is_locked() {
            return Err(FpsError::Locked(fps.locked_by()));
        }
        if data.0.is_empty() {
            return Err(TrajectoryError::new("trajectory is empty").into());
        }

        let config = fps.config();
        let safe_mode = &config.safe_mode;
        let (alpha_lo, alpha_hi) = config.positioner.alpha_range;
        let (beta_lo, beta_hi) = config.positioner.beta_range;

        let mut n_points = BTreeMap::new();

        for (&pid, axes) in &data.0 {
            let positioner = fps
                .bank()
                .get(pid)
                .ok_or(FpsError::UnknownPositioner(pid))?;
            if positioner.flags.disabled || positioner.flags.offline {
                return Err(FpsError::PositionerDisabled(pid));
            }

            for (axis_name, samples) in [("alpha", &axes.alpha), ("beta", &axes.beta)] {
                if samples.is_empty() {
                    return Err(TrajectoryError::new(format!(
                        "positioner {} has no {} samples",
                        pid, axis_name
                    ))
                    .into());
                }
                let mut last_time = -1.0f64;
                for &(angle, time) in samples {
                    if time < 0.0 || time < last_time {
                        return Err(TrajectoryError::new(format!(
                            "positioner {}: {} times must be non-negative and non-decreasing",
                            pid, axis_name
                        ))
                        .into());
                    }
                    last_time = time;

                    let (lo, hi) = if axis_name == "alpha" {
                        (alpha_lo, alpha_hi)
                    } else {
                        (beta_lo, beta_hi)
                    };
                    if angle < lo || angle > hi {
                        return Err(FpsError::SafeModeViolation(format!(
                            "positioner {}: {} = {:.2} outside [{:.1}, {:.1}]",
                            pid, axis_name, angle, lo, hi
                        )));
                    }
                    if axis_name == "beta" && safe_mode.enabled && angle < safe_mode.min_beta {
                        return Err(FpsError::SafeModeViolation(format!(
                            "safe mode is on and positioner {} beta = {:.2} < {:.1}",
                            pid, angle, safe_mode.min_beta
                        )));
                    }
                }
            }

            n_points.insert(pid, (axes.alpha.len() as u32, axes.beta.len() as u32));
        }

        let move_time = data.move_time();

        Ok(Self {
            fps,
            data,
            n_points,
            move_time,
            failed: HashMap::new(),
            start_time: None,
            start_stamp: None,
            initial_positions: BTreeMap::new(),
        })
    }

    fn pids(&self) -> Vec<u16> {
        self.data.positioner_ids()
    }

    /// 上传阶段失败时广播中止，不留半上传的轨迹
    fn abort_upload(&self) {
        if let Err(e) = self.fps.stop_trajectory(false) {
            warn!(error = %e, "failed to abort trajectory upload");
        }
    }

    fn record_command_failures(
        &mut self,
        result: &crate::scheduler::CommandResult,
        rejected: TrajectoryFailure,
    ) {
        if result.transport_error {
            for pid in self.pids() {
                self.failed.entry(pid).or_insert(TrajectoryFailure::InterfaceError);
            }
            return;
        }
        for reply in &result.replies {
            if !reply.response_code.is_accepted() {
                self.failed.insert(reply.positioner_id, rejected);
            }
        }
        if result.status.timed_out() && result.replies.is_empty() {
            for pid in self.pids() {
                self.failed.entry(pid).or_insert(rejected);
            }
        }
    }

    /// 发送轨迹（不启动）
    pub fn send(&mut self) -> Result<()> {
        // 停掉残余运动，确认机群静止
        self.fps.stop_trajectory(false)?;

        if !self.fps.update_status()? {
            return Err(TrajectoryError::new("some positioners did not respond").into());
        }
        if self.fps.bank().any_moving() {
            return Err(FpsError::Moving);
        }

        for pid in self.pids() {
            let positioner = self
                .fps
                .bank()
                .get(pid)
                .ok_or(FpsError::UnknownPositioner(pid))?;
            if !positioner.ready_for_trajectory() {
                return Err(TrajectoryError::new(format!(
                    "positioner {} is not ready to receive a trajectory",
                    pid
                ))
                .into());
            }
        }

        self.initial_positions = self
            .pids()
            .iter()
            .filter_map(|&pid| {
                self.fps.bank().get(pid).and_then(|p| p.position()).map(|pos| (pid, pos))
            })
            .collect();

        // --- 1. SEND_NEW_TRAJECTORY：两轴样本数 ---
        let mut new_traj_data: HashMap<u16, Vec<Vec<u8>>> = HashMap::new();
        for (&pid, &(n_alpha, n_beta)) in &self.n_points {
            new_traj_data.insert(pid, vec![encode_new_trajectory(n_alpha, n_beta).to_vec()]);
        }
        let result = self
            .fps
            .send_command(
                Command::new(CommandId::SendNewTrajectory, self.pids())
                    .with_data(new_traj_data),
            )?
            .wait();
        if !result.succeeded() {
            self.record_command_failures(&result, TrajectoryFailure::NotAcceptedNew);
            self.abort_upload();
            return Err(TrajectoryError::with_failures(
                "SEND_NEW_TRAJECTORY was not accepted",
                self.failed.clone(),
            )
            .into());
        }

        // --- 2. SEND_TRAJECTORY_DATA：分块，先 alpha 后 beta ---
        let config = self.fps.config();
        let chunk = config.positioner.trajectory_chunk;
        let motor_steps = config.positioner.motor_steps;
        let time_step = config.positioner.time_step;

        let send_start = Instant::now();
        for axis in [Axis::Alpha, Axis::Beta] {
            let max_points = self
                .data
                .0
                .values()
                .map(|axes| axis.samples(axes).len())
                .max()
                .unwrap_or(0);

            for offset in (0..max_points).step_by(chunk) {
                let mut chunk_data: HashMap<u16, Vec<Vec<u8>>> = HashMap::new();
                let mut chunk_pids: Vec<u16> = Vec::new();

                for (&pid, axes) in &self.data.0 {
                    let samples = axis.samples(axes);
                    let window: Vec<Vec<u8>> = samples
                        .iter()
                        .skip(offset)
                        .take(chunk)
                        .map(|&(angle, time)| {
                            encode_trajectory_point(angle, time, motor_steps, time_step).to_vec()
                        })
                        .collect();
                    if window.is_empty() {
                        continue;
                    }
                    chunk_pids.push(pid);
                    chunk_data.insert(pid, window);
                }
                if chunk_pids.is_empty() {
                    continue;
                }

                let result = self
                    .fps
                    .send_command(
                        Command::new(CommandId::SendTrajectoryData, chunk_pids)
                            .with_data(chunk_data),
                    )?
                    .wait();
                if !result.succeeded() {
                    self.record_command_failures(&result, TrajectoryFailure::NotAcceptedData);
                    self.abort_upload();
                    return Err(TrajectoryError::with_failures(
                        "at least one SEND_TRAJECTORY_DATA message failed",
                        self.failed.clone(),
                    )
                    .into());
                }
            }
        }

        // --- 3. TRAJECTORY_DATA_END ---
        let result = self
            .fps
            .send_command(Command::new(CommandId::TrajectoryDataEnd, self.pids()))?
            .wait();
        if !result.succeeded() {
            self.record_command_failures(&result, TrajectoryFailure::NotAcceptedEnd);
            self.abort_upload();
            return Err(TrajectoryError::with_failures(
                "TRAJECTORY_DATA_END failed",
                self.failed.clone(),
            )
            .into());
        }

        debug!(
            positioners = self.pids().len(),
            elapsed_ms = send_start.elapsed().as_millis() as u64,
            "trajectory data sent"
        );
        Ok(())
    }

    /// 广播启动并监视到完成
    pub fn start(&mut self) -> Result<()> {
        let expected = self
            .fps
            .bank()
            .snapshot()
            .iter()
            .filter(|p| !p.flags.offline)
            .count();

        let result = self
            .fps
            .send_command(
                Command::broadcast(CommandId::StartTrajectory)
                    .with_timeout(Duration::from_secs(1))
                    .with_expected_replies(expected),
            )?
            .wait();
        if !result.succeeded() {
            for pid in self.pids() {
                self.failed.insert(pid, TrajectoryFailure::DidNotStart);
            }
            self.abort_upload();
            return Err(TrajectoryError::with_failures(
                "START_TRAJECTORY failed",
                self.failed.clone(),
            )
            .into());
        }

        self.start_time = Some(Instant::now());
        self.start_stamp = Some(unix_now());
        self.fps.set_pollers_paused(true);
        self.fps.publish(FpsEvent::TrajectoryStarted {
            positioner_ids: self.pids(),
        });
        info!(
            positioners = self.pids().len(),
            move_time_s = self.move_time,
            "trajectory started"
        );

        let monitor_result = self.monitor();
        self.fps.set_pollers_paused(false);
        monitor_result
    }

    /// 轮询状态直到全部到位 / 失败 / 机群被锁
    fn monitor(&mut self) -> Result<()> {
        let config = self.fps.config();
        let poll = self.fps.config().trajectory_poll();
        let tolerance = config.positioner.position_tolerance;
        let start = self.start_time.expect("monitor without start");

        // 启动一秒后确认机群确实动了起来；瞬时短移动没有可观测的
        // 运动窗口，跳过该检查
        let mut startup_checked = self.move_time <= 1.0;

        loop {
            std::thread::sleep(poll.min(Duration::from_millis(250)));

            if self.fps.is_locked() {
                self.mark_locked_failures();
                return Err(TrajectoryError::with_failures(
                    "the FPS got locked during the trajectory",
                    self.failed.clone(),
                )
                .into());
            }

            self.fps.update_status()?;

            let snapshot: Vec<_> = self
                .pids()
                .iter()
                .filter_map(|&pid| self.fps.bank().get(pid))
                .collect();

            if let Some(collided) = snapshot.iter().find(|p| p.collided()) {
                // 碰撞事件随后会锁住机群；这里先行标记
                let collided_id = collided.id;
                self.mark_locked_failures();
                self.failed.insert(collided_id, TrajectoryFailure::Collided);
                return Err(TrajectoryError::with_failures(
                    format!("positioner {} collided", collided_id),
                    self.failed.clone(),
                )
                .into());
            }

            let elapsed = start.elapsed().as_secs_f64();

            if !startup_checked && elapsed >= 1.0 {
                startup_checked = true;
                if snapshot.iter().all(|p| p.status.has_displacement_completed()) {
                    for pid in self.pids() {
                        self.failed.insert(pid, TrajectoryFailure::DidNotStart);
                    }
                    self.abort_upload();
                    return Err(TrajectoryError::with_failures(
                        "trajectory did not start",
                        self.failed.clone(),
                    )
                    .into());
                }
            }

            let all_done = snapshot
                .iter()
                .all(|p| p.status.has_displacement_completed());
            if all_done && (startup_checked || elapsed >= self.move_time) {
                break;
            }

            if elapsed > self.move_time + MOVE_GRACE {
                for p in &snapshot {
                    if !p.status.has_displacement_completed() {
                        self.failed.insert(p.id, TrajectoryFailure::DidNotReach);
                    }
                }
                self.abort_upload();
                return Err(TrajectoryError::with_failures(
                    "some positioners did not complete the move",
                    self.failed.clone(),
                )
                .into());
            }
        }

        // 固件偶发问题：个别定位器自认为到位但还停在原地。
        // 结束后补一条中止再刷新位置能拿到正确读数。
        self.fps.stop_trajectory(false)?;
        self.fps.update_position()?;

        let mut missed = Vec::new();
        for (&pid, axes) in &self.data.0 {
            let target_alpha = axes.alpha.last().map(|&(a, _)| a).unwrap_or(0.0);
            let target_beta = axes.beta.last().map(|&(b, _)| b).unwrap_or(0.0);
            let position = self.fps.bank().get(pid).and_then(|p| p.position());
            let reached = position.is_some_and(|(alpha, beta)| {
                (alpha - target_alpha).abs() <= tolerance && (beta - target_beta).abs() <= tolerance
            });
            if !reached {
                self.failed.insert(pid, TrajectoryFailure::DidNotReach);
                missed.push(pid);
            }
        }
        if !missed.is_empty() {
            return Err(TrajectoryError::with_failures(
                format!("positioners {:?} did not reach their destinations", missed),
                self.failed.clone(),
            )
            .into());
        }

        Ok(())
    }

    /// 机群被锁时的失败标记：碰撞的记碰撞，其余记被中止
    fn mark_locked_failures(&mut self) {
        let locked_by = self.fps.locked_by();
        for pid in self.pids() {
            if locked_by.contains(&pid)
                || self.fps.bank().get(pid).map(|p| p.collided()).unwrap_or(false)
            {
                self.failed.insert(pid, TrajectoryFailure::Collided);
            } else {
                self.failed.entry(pid).or_insert(TrajectoryFailure::Aborted);
            }
        }
    }

    /// 落一份诊断转储（尽力而为，失败只记日志）
    pub fn dump(&self, success: bool) {
        let Some(dir) = self.fps.config().trajectory_dump_path.clone() else {
            return;
        };

        let final_positions = self
            .pids()
            .iter()
            .filter_map(|&pid| {
                self.fps.bank().get(pid).and_then(|p| p.position()).map(|pos| (pid, pos))
            })
            .collect();

        let dump = TrajectoryDump {
            success,
            start_time: self.start_stamp,
            end_time: unix_now(),
            move_time: self.move_time,
            initial_positions: self.initial_positions.clone(),
            final_positions,
            failed_positioners: self.failed.clone(),
            trajectory: self.data.clone(),
        };

        if let Err(e) = write_dump(&dir, &dump) {
            warn!(error = %e, "failed to write trajectory dump");
        }
    }
}

/// 执行一整条轨迹（`Fps::send_trajectory` 的实现）
pub(crate) fn run(fps: &Fps, data: TrajectoryData) -> Result<()> {
    let mut trajectory = Trajectory::new(fps, data)?;

    let outcome = trajectory.send().and_then(|()| trajectory.start());
    let success = outcome.is_ok();

    trajectory.dump(success);
    fps.publish(FpsEvent::TrajectoryFinished { success });

    if success {
        fps.note_trajectories_executed(&trajectory.pids());
        info!("all positioners reached their destinations");
    }
    outcome
}

#[derive(Clone, Copy)]
enum Axis {
    Alpha,
    Beta,
}

impl Axis {
    fn samples<'a>(&self, axes: &'a AxisSamples) -> &'a [(f64, f64)] {
        match self {
            Axis::Alpha => &axes.alpha,
            Axis::Beta => &axes.beta,
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn write_dump(dir: &PathBuf, dump: &TrajectoryDump) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let stamp = (unix_now() * 1000.0) as u64;
    let path = dir.join(format!("trajectory-{}.json", stamp));
    let text = serde_json::to_string_pretty(dump)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&path, text)?;
    debug!(path = %path.display(), "trajectory dump written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trajectory_data_round_trip_json() {
        let mut data = TrajectoryData::new();
        data.insert(4, vec![(0.0, 0.0), (90.0, 3.0)], vec![(180.0, 0.0), (45.0, 4.0)]);

        let text = serde_json::to_string(&data).unwrap();
        let parsed: TrajectoryData = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.positioner_ids(), vec![4]);
        assert_eq!(parsed.0[&4].alpha.len(), 2);
        assert_eq!(parsed.0[&4].beta[1], (45.0, 4.0));
    }

    #[test]
    fn test_trajectory_data_parses_plain_mapping() {
        // 引擎约定的文件格式：id → {alpha: [[deg, s], ...], beta: [...]}
        let text = r#"{"4": {"alpha": [[90.0, 0.0], [91.0, 3.0]], "beta": [[20.0, 0.0], [23.0, 4.0]]}}"#;
        let parsed: TrajectoryData = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.move_time(), 4.0);
    }

    #[test]
    fn test_move_time_is_max_over_all_axes() {
        let mut data = TrajectoryData::new();
        data.insert(4, vec![(0.0, 1.0)], vec![(0.0, 2.0)]);
        data.insert(8, vec![(0.0, 5.0)], vec![(0.0, 0.5)]);
        assert_eq!(data.move_time(), 5.0);
    }

    #[test]
    fn test_failure_serialises_screaming_snake() {
        let text = serde_json::to_string(&TrajectoryFailure::NotAcceptedNew).unwrap();
        assert_eq!(text, "\"NOT_ACCEPTED_NEW\"");
    }
}
