//! 调度器层集成测试：互斥、UID 池闭合、回复路由、广播完成语义

use std::sync::Arc;
use std::time::{Duration, Instant};

use fps_sdk::can::VirtualNetwork;
use fps_sdk::command::{Command, CommandStatus};
use fps_sdk::positioner::{Positioner, PositionerBank};
use fps_sdk::protocol::{CommandId, IdentifierLayout, DEFAULT_MOTOR_STEPS};
use fps_sdk::scheduler::CanScheduler;

fn scheduler_on(network: &VirtualNetwork, ids: &[u16]) -> (CanScheduler, Arc<PositionerBank>) {
    let bank = Arc::new(PositionerBank::new());
    for &id in ids {
        bank.insert(Positioner::new(id));
    }
    let scheduler = CanScheduler::new(
        vec![Box::new(network.bus())],
        IdentifierLayout::default(),
        DEFAULT_MOTOR_STEPS,
        Arc::clone(&bank),
    );
    (scheduler, bank)
}

#[test]
fn unicast_command_completes_with_reply() {
    let network = VirtualNetwork::new(&[4]);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    let result = scheduler
        .submit(Command::new(CommandId::GetStatus, vec![4u16]))
        .unwrap()
        .wait();

    assert_eq!(result.status, CommandStatus::Done);
    assert_eq!(result.replies.len(), 1);
    assert_eq!(result.replies[0].positioner_id, 4);

    scheduler.shutdown();
}

#[test]
fn replies_are_routed_to_the_owning_command() {
    let network = VirtualNetwork::new(&[4, 8]);
    let (scheduler, _bank) = scheduler_on(&network, &[4, 8]);
    let scheduler = Arc::new(scheduler);

    // 两条并发命令指向不同定位器，各自只能看到自己的回复
    let mut handles = Vec::new();
    for pid in [4u16, 8u16] {
        let scheduler = Arc::clone(&scheduler);
        handles.push(std::thread::spawn(move || {
            let result = scheduler
                .submit(Command::new(CommandId::GetActualPosition, vec![pid]))
                .unwrap()
                .wait();
            (pid, result)
        }));
    }

    for handle in handles {
        let (pid, result) = handle.join().unwrap();
        assert_eq!(result.status, CommandStatus::Done);
        assert!(result.replies.iter().all(|r| r.positioner_id == pid));
    }

    scheduler.shutdown();
}

#[test]
fn broadcast_blocks_unicast_of_same_command() {
    // 全部静音：广播收不到回复，持有互斥直到超时裁决
    let network = VirtualNetwork::new(&[4, 8]);
    network.with_positioner(4, |p| p.mute = true);
    network.with_positioner(8, |p| p.mute = true);
    let (scheduler, _bank) = scheduler_on(&network, &[4, 8]);
    let scheduler = Arc::new(scheduler);

    let broadcast = scheduler
        .submit(
            Command::broadcast(CommandId::GetStatus).with_timeout(Duration::from_millis(400)),
        )
        .unwrap();

    let started = Instant::now();
    let unicast_thread = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || {
            // 广播在途时同命令号的单播必须排队
            let result = scheduler
                .submit(
                    Command::new(CommandId::GetStatus, vec![4u16])
                        .with_timeout(Duration::from_millis(200)),
                )
                .unwrap()
                .wait();
            (Instant::now(), result)
        })
    };

    std::thread::sleep(Duration::from_millis(150));
    assert!(!unicast_thread.is_finished(), "unicast ran during broadcast");

    // 等待广播超时裁决并释放互斥
    let broadcast_result = broadcast.wait();
    assert_eq!(broadcast_result.status, CommandStatus::TimedOut);

    let (unicast_done_at, _result) = unicast_thread.join().unwrap();
    assert!(unicast_done_at.duration_since(started) >= Duration::from_millis(350));

    scheduler.shutdown();
}

#[test]
fn uid_pool_closes_over_many_submissions() {
    let network = VirtualNetwork::new(&[4]);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    // UID 池大小 63：若终态不归还 UID，这个循环在第 64 次就会死锁 / 报 EmptyPool
    for round in 0..200 {
        let result = scheduler
            .submit(Command::new(CommandId::GetStatus, vec![4u16]))
            .unwrap()
            .wait();
        assert_eq!(result.status, CommandStatus::Done, "round {}", round);
    }

    scheduler.shutdown();
}

#[test]
fn multi_message_command_uses_distinct_uids() {
    let network = VirtualNetwork::new(&[4]);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    // 同一 (command_id, positioner_id) 的三条消息必须带不同 UID
    let mut data = std::collections::HashMap::new();
    data.insert(4u16, vec![vec![1u8], vec![2u8], vec![3u8]]);
    let result = scheduler
        .submit(Command::new(CommandId::SendTrajectoryData, vec![4u16]).with_data(data))
        .unwrap()
        .wait();
    assert_eq!(result.status, CommandStatus::Done);

    let layout = IdentifierLayout::default();
    let uids: Vec<u8> = network
        .sent_for(CommandId::SendTrajectoryData)
        .iter()
        .map(|f| layout.decode(f.id).uid)
        .collect();
    assert_eq!(uids.len(), 3);
    let mut unique = uids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 3, "duplicate UIDs within one chunk: {:?}", uids);

    scheduler.shutdown();
}

#[test]
fn broadcast_completes_with_partial_replies() {
    let network = VirtualNetwork::new(&[4, 8, 13]);
    network.with_positioner(13, |p| p.mute = true);
    let (scheduler, _bank) = scheduler_on(&network, &[4, 8, 13]);

    // 3 个参与者只有 2 个回复：超时裁决为 Done，带着已有回复
    let result = scheduler
        .submit(
            Command::broadcast(CommandId::GetStatus)
                .with_timeout(Duration::from_millis(300))
                .with_expected_replies(3),
        )
        .unwrap()
        .wait();

    assert_eq!(result.status, CommandStatus::Done);
    assert_eq!(result.replies.len(), 2);

    scheduler.shutdown();
}

#[test]
fn broadcast_times_out_with_no_replies() {
    let network = VirtualNetwork::new(&[4]);
    network.with_positioner(4, |p| p.mute = true);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    let result = scheduler
        .submit(
            Command::broadcast(CommandId::GetStatus).with_timeout(Duration::from_millis(200)),
        )
        .unwrap()
        .wait();
    assert_eq!(result.status, CommandStatus::TimedOut);

    scheduler.shutdown();
}

#[test]
fn rejection_fails_the_command() {
    let network = VirtualNetwork::new(&[4]);
    network.with_positioner(4, |p| {
        p.reject_with = Some(fps_sdk::ResponseCode::ValueOutOfRange)
    });
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    let result = scheduler
        .submit(Command::new(CommandId::SetSpeed, vec![4u16]))
        .unwrap()
        .wait();
    assert_eq!(result.status, CommandStatus::Failed);
    assert!(!result.transport_error);
    assert!(result.first_rejection().is_some());

    scheduler.shutdown();
}

#[test]
fn fire_and_forget_completes_immediately() {
    let network = VirtualNetwork::new(&[4]);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    let handle = scheduler
        .submit(
            Command::broadcast(CommandId::SendTrajectoryAbort).with_timeout(Duration::ZERO),
        )
        .unwrap();
    assert_eq!(handle.status(), CommandStatus::Done);

    // 迟到的回复被丢弃，不会影响后续命令
    std::thread::sleep(Duration::from_millis(50));
    let result = scheduler
        .submit(Command::new(CommandId::GetStatus, vec![4u16]))
        .unwrap()
        .wait();
    assert_eq!(result.status, CommandStatus::Done);

    scheduler.shutdown();
}

#[test]
fn non_broadcastable_command_is_rejected() {
    let network = VirtualNetwork::new(&[4]);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    let outcome = scheduler.submit(Command::broadcast(CommandId::SendNewTrajectory));
    assert!(matches!(
        outcome,
        Err(fps_sdk::FpsError::NotBroadcastable(CommandId::SendNewTrajectory))
    ));

    scheduler.shutdown();
}

#[test]
fn scheduler_shutdown_is_idempotent() {
    let network = VirtualNetwork::new(&[4]);
    let (scheduler, _bank) = scheduler_on(&network, &[4]);

    scheduler.shutdown();
    scheduler.shutdown();

    assert!(matches!(
        scheduler.submit(Command::new(CommandId::GetStatus, vec![4u16])),
        Err(fps_sdk::FpsError::ShutDown)
    ));
}
