//! 轨迹引擎集成测试：goto、碰撞中断、未启动检测、校验单调性

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{fps_on, test_config};
use fps_sdk::can::VirtualNetwork;
use fps_sdk::protocol::IdentifierLayout;
use fps_sdk::{CommandId, FpsError, FpsEvent, TrajectoryData, TrajectoryFailure};

/// S2：单台 goto 的完整链路
#[test]
fn goto_moves_a_single_positioner() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    // 起始位置 (0, 180)
    network.with_positioner(4, |p| {
        p.alpha = 0.0;
        p.beta = 180.0;
    });
    fps.update_position().unwrap();
    network.clear_sent();

    let mut targets = HashMap::new();
    targets.insert(4u16, (90.0, 45.0));
    fps.goto(targets, None).unwrap();

    // 线协议：1 × SEND_NEW_TRAJECTORY，每轴 2 帧数据（只有端点），
    // 1 × TRAJECTORY_DATA_END，1 × 广播 START_TRAJECTORY
    let layout = IdentifierLayout::default();
    assert_eq!(network.sent_for(CommandId::SendNewTrajectory).len(), 1);
    assert_eq!(network.sent_for(CommandId::SendTrajectoryData).len(), 4);
    assert_eq!(network.sent_for(CommandId::TrajectoryDataEnd).len(), 1);

    let starts = network.sent_for(CommandId::StartTrajectory);
    assert_eq!(starts.len(), 1);
    assert_eq!(layout.decode(starts[0].id).positioner_id, 0, "start must be broadcast");

    // 到位 ±0.1°，轨迹计数 +1
    let positioner = fps.positioner(4).unwrap();
    let (alpha, beta) = positioner.position().unwrap();
    assert!((alpha - 90.0).abs() <= 0.1, "alpha = {}", alpha);
    assert!((beta - 45.0).abs() <= 0.1, "beta = {}", beta);
    assert_eq!(fps.state().trajectories_executed, 1);
    assert_eq!(positioner.trajectories, 1);

    fps.shutdown();
}

/// S4：轨迹执行中注入碰撞
#[test]
fn collision_during_trajectory_locks_the_fleet() {
    let network = VirtualNetwork::new(&[4, 8]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();
    network.clear_sent();

    // 足够长的轨迹，留出注入窗口
    let mut data = TrajectoryData::new();
    for pid in [4u16, 8u16] {
        data.insert(
            pid,
            vec![(0.0, 0.0), (30.0, 2.5)],
            vec![(0.0, 0.0), (30.0, 2.5)],
        );
    }

    // 运动中途让 8 号报碰撞
    let injector = {
        let network = network.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1400));
            network.set_collided(8);
        })
    };

    let outcome = fps.send_trajectory(data);
    injector.join().unwrap();

    let error = match outcome {
        Err(FpsError::Trajectory(error)) => error,
        other => panic!("expected trajectory error, got {:?}", other.err()),
    };
    assert_eq!(
        error.failed_positioners.get(&8),
        Some(&TrajectoryFailure::Collided)
    );
    assert_eq!(
        error.failed_positioners.get(&4),
        Some(&TrajectoryFailure::Aborted)
    );

    // 机群锁定且记录了肇事者
    wait_until(|| fps.is_locked(), Duration::from_secs(2));
    assert!(fps.locked_by().contains(&8));

    // 观察到 SEND_TRAJECTORY_ABORT 广播
    wait_until(
        || !network.sent_for(CommandId::SendTrajectoryAbort).is_empty(),
        Duration::from_secs(2),
    );

    fps.shutdown();
}

/// 性质 8：监视期间操作员上锁后，解锁前不再发出运动帧
#[test]
fn no_motion_frames_between_abort_and_unlock() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    let mut data = TrajectoryData::new();
    data.insert(4, vec![(0.0, 0.0), (20.0, 2.5)], vec![(0.0, 0.0), (20.0, 2.5)]);

    // 监视进行到一半时上锁
    let locker = {
        let fps = fps.clone();
        let network = network.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1200));
            network.clear_sent();
            fps.lock(Vec::new()).unwrap();
        })
    };

    let outcome = fps.send_trajectory(data);
    locker.join().unwrap();
    assert!(outcome.is_err());

    // 上锁后观察到中止广播
    assert!(!network.sent_for(CommandId::SendTrajectoryAbort).is_empty());

    // 锁定期间任何运动命令都进不了总线
    network.clear_sent();
    let mut targets = HashMap::new();
    targets.insert(4u16, (5.0, 5.0));
    assert!(matches!(
        fps.goto(targets.clone(), None),
        Err(FpsError::Locked(_))
    ));
    assert!(network.sent_for(CommandId::SendNewTrajectory).is_empty());
    assert!(network.sent_for(CommandId::StartTrajectory).is_empty());

    // 解锁后恢复
    fps.unlock().unwrap();
    fps.goto(targets, None).unwrap();

    fps.shutdown();
}

/// 广播启动被固件忽略时判定"未启动"
#[test]
fn undetected_start_fails_the_trajectory() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    network.hold_start(true);

    let mut data = TrajectoryData::new();
    data.insert(4, vec![(0.0, 0.0), (15.0, 2.0)], vec![(0.0, 0.0), (15.0, 2.0)]);

    let outcome = fps.send_trajectory(data);
    let error = match outcome {
        Err(FpsError::Trajectory(error)) => error,
        other => panic!("expected trajectory error, got {:?}", other.err()),
    };
    assert_eq!(
        error.failed_positioners.get(&4),
        Some(&TrajectoryFailure::DidNotStart)
    );

    fps.shutdown();
}

/// 性质 7：校验失败的轨迹绝不上总线
#[test]
fn invalid_trajectories_never_reach_the_wire() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();
    network.clear_sent();

    // 时间倒退
    let mut data = TrajectoryData::new();
    data.insert(4, vec![(0.0, 1.0), (10.0, 0.5)], vec![(0.0, 0.0)]);
    assert!(fps.send_trajectory(data).is_err());

    // 空轴
    let mut data = TrajectoryData::new();
    data.insert(4, vec![], vec![(0.0, 0.0)]);
    assert!(fps.send_trajectory(data).is_err());

    // 未知定位器
    let mut data = TrajectoryData::new();
    data.insert(99, vec![(0.0, 0.0)], vec![(0.0, 0.0)]);
    assert!(matches!(
        fps.send_trajectory(data),
        Err(FpsError::UnknownPositioner(99))
    ));

    // 超出角度界限
    let mut data = TrajectoryData::new();
    data.insert(4, vec![(0.0, 0.0), (720.0, 1.0)], vec![(0.0, 0.0)]);
    assert!(matches!(
        fps.send_trajectory(data),
        Err(FpsError::SafeModeViolation(_))
    ));

    assert!(network.sent_frames().is_empty(), "invalid trajectory reached the wire");

    fps.shutdown();
}

/// 安全模式限制 beta 最小角
#[test]
fn safe_mode_rejects_low_beta() {
    let network = VirtualNetwork::new(&[4]);
    let mut config = test_config();
    config.safe_mode.enabled = true;
    config.safe_mode.min_beta = 160.0;
    let fps = fps_on(&network, config);
    fps.initialise().unwrap();
    network.clear_sent();

    let mut data = TrajectoryData::new();
    data.insert(4, vec![(0.0, 0.0)], vec![(150.0, 0.0)]);
    assert!(matches!(
        fps.send_trajectory(data),
        Err(FpsError::SafeModeViolation(_))
    ));
    assert!(network.sent_frames().is_empty());

    fps.shutdown();
}

/// 成功的轨迹会落诊断转储；失败也一样
#[test]
fn trajectory_dump_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let network = VirtualNetwork::new(&[4]);
    let mut config = test_config();
    config.trajectory_dump_path = Some(dir.path().to_path_buf());
    let fps = fps_on(&network, config);
    fps.initialise().unwrap();

    let mut targets = HashMap::new();
    targets.insert(4u16, (10.0, 10.0));
    fps.goto(targets, None).unwrap();

    let dumps: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(dumps.len(), 1);

    let text = std::fs::read_to_string(dumps[0].as_ref().unwrap().path()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["success"], serde_json::Value::Bool(true));
    assert!(json["final_positions"]["4"].is_array());

    fps.shutdown();
}

/// 事件流：轨迹开始与结束
#[test]
fn trajectory_events_are_published() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    let events = fps.subscribe();

    let mut targets = HashMap::new();
    targets.insert(4u16, (5.0, 5.0));
    fps.goto(targets, None).unwrap();

    let mut started = false;
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        match event {
            FpsEvent::TrajectoryStarted { positioner_ids } => {
                started = true;
                assert_eq!(positioner_ids, vec![4]);
            }
            FpsEvent::TrajectoryFinished { success } => finished = Some(success),
            _ => {}
        }
    }
    assert!(started);
    assert_eq!(finished, Some(true));

    fps.shutdown();
}

fn wait_until(predicate: impl Fn() -> bool, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("condition not reached within {:?}", timeout);
}
