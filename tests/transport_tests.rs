//! 传输层故障集成测试：接口断开、在途命令失败、重连恢复

mod common;

use std::time::Duration;

use common::{fps_on, test_config};
use fps_sdk::can::VirtualNetwork;
use fps_sdk::command::{Command, CommandStatus};
use fps_sdk::{CanError, CommandId, FpsError, FpsEvent};

/// S5：在途单播期间断开接口
#[test]
fn disconnect_fails_inflight_command_and_recovers() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    let events = fps.subscribe();

    // 让定位器不回复，命令停留在途
    network.with_positioner(4, |p| p.mute = true);

    let handle = fps
        .send_command(
            Command::new(CommandId::GetActualPosition, vec![4u16])
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    // 命令在途时断开接口
    std::thread::sleep(Duration::from_millis(100));
    network.set_connected(false);

    let result = handle.wait();
    assert_eq!(result.status, CommandStatus::Failed);
    assert!(result.transport_error, "failure should carry the transport tag");
    assert!(matches!(
        result.into_result(),
        Err(FpsError::Can(CanError::Disconnected))
    ));

    // 恢复连接，等待后台重连
    network.with_positioner(4, |p| p.mute = false);
    network.set_connected(true);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut reset_seen = false;
    while std::time::Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(FpsEvent::TransportReset { interface: 0 }) => {
                reset_seen = true;
                break;
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }
    assert!(reset_seen, "no transport-reset event after reconnection");

    // 重新初始化后命令恢复正常
    fps.initialise().unwrap();
    let result = fps
        .send_command(Command::new(CommandId::GetActualPosition, vec![4u16]))
        .unwrap()
        .wait();
    assert_eq!(result.status, CommandStatus::Done);

    fps.shutdown();
}

/// 断开期间的新提交被同步拒绝
#[test]
fn submission_fails_while_interface_is_down() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    network.set_connected(false);
    // 等 IO 线程察觉断开
    std::thread::sleep(Duration::from_millis(100));

    let outcome = fps.send_command(Command::new(CommandId::GetStatus, vec![4u16]));
    assert!(matches!(outcome, Err(FpsError::Can(CanError::Disconnected))));

    fps.shutdown();
}

/// 接口故障会发出告警事件
#[test]
fn interface_failure_raises_alert() {
    let network = VirtualNetwork::new(&[4]);
    let fps = fps_on(&network, test_config());
    fps.initialise().unwrap();

    let events = fps.subscribe();
    network.set_connected(false);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let mut alert_seen = false;
    while std::time::Instant::now() < deadline {
        if let Ok(FpsEvent::Alert { message }) = events.recv_timeout(Duration::from_millis(100)) {
            assert!(message.contains("interface"));
            alert_seen = true;
            break;
        }
    }
    assert!(alert_seen, "no alert event after interface failure");

    fps.shutdown();
}
