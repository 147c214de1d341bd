//! 集成测试公共设施

use fps_sdk::can::VirtualNetwork;
use fps_sdk::{Fps, FpsConfig};

/// 面向测试的快节奏配置
pub fn test_config() -> FpsConfig {
    let mut config = FpsConfig::default();
    // 测试里手动驱动状态刷新，不跑后台轮询
    config.poller.start_pollers = false;
    config.positioner.initialise_timeout_s = 0.3;
    config.positioner.trajectory_poll_s = 0.1;
    // 缩短 goto 的计算移动时间，压低测试时长
    config.positioner.reduction_ratio = 40.0;
    config
}

/// 在虚拟网络上建 FPS
pub fn fps_on(network: &VirtualNetwork, config: FpsConfig) -> Fps {
    Fps::with_adapters(config, vec![Box::new(network.bus())]).expect("failed to build FPS")
}

/// 初始化日志（重复调用安全）
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
