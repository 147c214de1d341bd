//! 命令对象与状态机
//!
//! 一条命令由一个或多个出站消息组成，按 `(command_id, positioner_id, uid)`
//! 匹配回复。状态机：
//!
//! ```text
//! Ready → Running → { Done, Failed, TimedOut, Cancelled }
//! ```
//!
//! 回复只在 `Running` 状态下被接受；任何非接受响应码使命令失败，
//! 除非该码是 `UNKNOWN_COMMAND` 且命令允许忽略（默认允许）。
//! 终态一旦进入不再改变，UID 由调度器在终态时归还池中。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::protocol::commands::CommandId;
use crate::protocol::status::ResponseCode;
use crate::protocol::BROADCAST_ID;

// ============================================================================
// 状态
// ============================================================================

/// 命令状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ready,
    Running,
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    /// 是否已进入终态
    pub fn is_done(&self) -> bool {
        !matches!(self, CommandStatus::Ready | CommandStatus::Running)
    }

    /// 是否失败（含取消）
    pub fn failed(&self) -> bool {
        matches!(self, CommandStatus::Failed | CommandStatus::Cancelled)
    }

    /// 是否超时
    pub fn timed_out(&self) -> bool {
        matches!(self, CommandStatus::TimedOut)
    }
}

// ============================================================================
// 回复记录
// ============================================================================

/// 一条回复
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub positioner_id: u16,
    pub uid: u8,
    pub response_code: ResponseCode,
    pub data: [u8; 8],
    pub len: u8,
    pub interface: usize,
    pub bus: usize,
}

impl Reply {
    /// 有效数据切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

// ============================================================================
// 命令描述
// ============================================================================

/// 待提交的命令
///
/// 负载为每个定位器一组消息（大多数命令只有一条空消息）。
/// `positioner_ids == [0]` 表示广播。
#[derive(Debug, Clone)]
pub struct Command {
    pub command_id: CommandId,
    pub positioner_ids: Vec<u16>,
    /// 每个定位器的消息负载；缺省时发送一条空消息
    pub data: HashMap<u16, Vec<Vec<u8>>>,
    /// 超时覆盖；`None` 用注册表默认值，`Some(0)` 为 fire-and-forget
    pub timeout: Option<Duration>,
    /// 把 `UNKNOWN_COMMAND` 回复当作接受处理
    pub ignore_unknown: bool,
    /// 广播的期望回复数；达到即提前完成
    pub expected_replies: Option<usize>,
}

impl Command {
    /// 单播 / 多播命令
    pub fn new(command_id: CommandId, positioner_ids: impl Into<Vec<u16>>) -> Self {
        Self {
            command_id,
            positioner_ids: positioner_ids.into(),
            data: HashMap::new(),
            timeout: None,
            ignore_unknown: true,
            expected_replies: None,
        }
    }

    /// 广播命令
    pub fn broadcast(command_id: CommandId) -> Self {
        Self::new(command_id, vec![BROADCAST_ID])
    }

    /// 所有定位器共用同一负载
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        for &pid in &self.positioner_ids {
            self.data.insert(pid, vec![payload.clone()]);
        }
        self
    }

    /// 每个定位器独立负载（可为多条消息）
    pub fn with_data(mut self, data: HashMap<u16, Vec<Vec<u8>>>) -> Self {
        self.data = data;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expected_replies(mut self, n: usize) -> Self {
        self.expected_replies = Some(n);
        self
    }

    pub fn ignore_unknown(mut self, ignore: bool) -> Self {
        self.ignore_unknown = ignore;
        self
    }

    /// 是否为广播
    pub fn is_broadcast(&self) -> bool {
        self.positioner_ids == [BROADCAST_ID]
    }

    /// 生效的超时（注册表默认值或覆盖值）
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| self.command_id.spec().default_timeout())
    }

    /// 每个定位器的消息负载（无负载时补一条空消息）
    pub(crate) fn payloads_for(&self, pid: u16) -> Vec<Vec<u8>> {
        match self.data.get(&pid) {
            Some(payloads) if !payloads.is_empty() => payloads.clone(),
            _ => vec![Vec::new()],
        }
    }
}

// ============================================================================
// 运行时共享状态
// ============================================================================

/// 处理一条回复后的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    /// 回复已入账，命令继续运行
    Recorded,
    /// 回复被丢弃（命令已终态 / UID 不属于本命令）
    Dropped,
    /// 回复使命令进入终态
    Terminal(CommandStatus),
}

struct CommandState {
    status: CommandStatus,
    replies: Vec<Reply>,
}

/// 调度器与等待方共享的命令运行时状态
pub(crate) struct CommandShared {
    pub command_id: CommandId,
    pub is_broadcast: bool,
    pub ignore_unknown: bool,
    /// 出站消息总数（单播完成条件）
    pub n_messages: usize,
    /// 广播的期望回复数（提前完成条件）
    pub expected_replies: Option<usize>,
    /// 已分配的 `(positioner_id, uid)`，终态时归还
    pub uids: Vec<(u16, u8)>,
    /// 本命令经过的接口下标（接口故障时定位受影响命令）
    pub interfaces: Vec<usize>,
    pub timeout: Duration,
    pub started_at: Instant,
    /// 因接口故障而失败（区别于定位器拒绝）
    pub transport_error: std::sync::atomic::AtomicBool,

    state: Mutex<CommandState>,
    cond: Condvar,
}

impl CommandShared {
    pub fn new(
        command: &Command,
        uids: Vec<(u16, u8)>,
        interfaces: Vec<usize>,
        n_messages: usize,
    ) -> Self {
        Self {
            command_id: command.command_id,
            is_broadcast: command.is_broadcast(),
            ignore_unknown: command.ignore_unknown,
            n_messages,
            expected_replies: command.expected_replies,
            uids,
            interfaces,
            timeout: command.effective_timeout(),
            started_at: Instant::now(),
            transport_error: std::sync::atomic::AtomicBool::new(false),
            state: Mutex::new(CommandState {
                status: CommandStatus::Running,
                replies: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// 本命令占用的互斥作用域（广播为 `[0]`，单播为去重后的定位器表）
    pub fn scope(&self) -> Vec<u16> {
        if self.is_broadcast {
            vec![crate::protocol::BROADCAST_ID]
        } else {
            let mut pids: Vec<u16> = self.uids.iter().map(|&(pid, _)| pid).collect();
            pids.sort_unstable();
            pids.dedup();
            pids
        }
    }

    pub fn status(&self) -> CommandStatus {
        self.state.lock().status
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.state.lock().replies.clone()
    }

    /// 回复中被视为接受的数量（含被忽略的 UNKNOWN_COMMAND）
    fn accepted_count(replies: &[Reply], ignore_unknown: bool) -> usize {
        replies
            .iter()
            .filter(|r| {
                r.response_code.is_accepted()
                    || (ignore_unknown && r.response_code == ResponseCode::UnknownCommand)
            })
            .count()
    }

    /// 记录一条回复并推进状态机
    pub fn process_reply(&self, reply: Reply) -> ReplyOutcome {
        let mut state = self.state.lock();

        if state.status != CommandStatus::Running {
            debug!(
                command = self.command_id.name(),
                positioner_id = reply.positioner_id,
                status = ?state.status,
                "reply received after command reached terminal state"
            );
            return ReplyOutcome::Dropped;
        }

        if !self.is_broadcast
            && !self
                .uids
                .iter()
                .any(|&(pid, uid)| pid == reply.positioner_id && uid == reply.uid)
        {
            warn!(
                command = self.command_id.name(),
                positioner_id = reply.positioner_id,
                uid = reply.uid,
                "reply UID does not belong to this command"
            );
            return ReplyOutcome::Dropped;
        }

        state.replies.push(reply);

        let code = reply.response_code;
        if !code.is_accepted() && !(self.ignore_unknown && code == ResponseCode::UnknownCommand) {
            warn!(
                command = self.command_id.name(),
                positioner_id = reply.positioner_id,
                code = ?code,
                "command rejected by positioner"
            );
            state.status = CommandStatus::Failed;
            self.cond.notify_all();
            return ReplyOutcome::Terminal(CommandStatus::Failed);
        }

        let accepted = Self::accepted_count(&state.replies, self.ignore_unknown);
        let complete = if self.is_broadcast {
            self.expected_replies.is_some_and(|n| accepted >= n)
        } else {
            accepted >= self.n_messages
        };

        if complete {
            state.status = CommandStatus::Done;
            self.cond.notify_all();
            return ReplyOutcome::Terminal(CommandStatus::Done);
        }

        ReplyOutcome::Recorded
    }

    /// 外部强制进入终态（超时 / 取消 / 传输错误）
    ///
    /// 返回 `true` 表示本次调用完成了状态迁移；已处于终态时返回 `false`。
    pub fn finish(&self, status: CommandStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_done() {
            return false;
        }
        state.status = status;
        self.cond.notify_all();
        true
    }

    /// 超时裁决：广播收到过接受回复则算完成，否则超时
    pub fn timeout_status(&self) -> CommandStatus {
        if self.is_broadcast {
            let state = self.state.lock();
            if Self::accepted_count(&state.replies, self.ignore_unknown) > 0 {
                return CommandStatus::Done;
            }
        }
        CommandStatus::TimedOut
    }

    /// 阻塞等待终态，最多等 `timeout`
    ///
    /// 返回等待结束时的状态；仍在 `Running` 说明超时由调用方裁决。
    pub fn wait(&self, timeout: Duration) -> CommandStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.status.is_done() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(pid: u16, uid: u8, code: ResponseCode) -> Reply {
        Reply {
            positioner_id: pid,
            uid,
            response_code: code,
            data: [0; 8],
            len: 0,
            interface: 0,
            bus: 0,
        }
    }

    fn shared(command: &Command, uids: Vec<(u16, u8)>, n_messages: usize) -> CommandShared {
        CommandShared::new(command, uids, vec![0], n_messages)
    }

    #[test]
    fn test_unicast_completes_when_all_messages_acknowledged() {
        let command = Command::new(CommandId::GetStatus, vec![4u16]);
        let shared = shared(&command, vec![(4, 1)], 1);

        let outcome = shared.process_reply(reply(4, 1, ResponseCode::CommandAccepted));
        assert_eq!(outcome, ReplyOutcome::Terminal(CommandStatus::Done));
        assert_eq!(shared.status(), CommandStatus::Done);
    }

    #[test]
    fn test_multi_message_command_waits_for_all() {
        let command = Command::new(CommandId::SendTrajectoryData, vec![4u16]);
        let shared = shared(&command, vec![(4, 1), (4, 2)], 2);

        assert_eq!(
            shared.process_reply(reply(4, 1, ResponseCode::CommandAccepted)),
            ReplyOutcome::Recorded
        );
        assert_eq!(
            shared.process_reply(reply(4, 2, ResponseCode::CommandAccepted)),
            ReplyOutcome::Terminal(CommandStatus::Done)
        );
    }

    #[test]
    fn test_rejection_fails_command() {
        let command = Command::new(CommandId::SetSpeed, vec![4u16]);
        let shared = shared(&command, vec![(4, 1)], 1);

        let outcome = shared.process_reply(reply(4, 1, ResponseCode::ValueOutOfRange));
        assert_eq!(outcome, ReplyOutcome::Terminal(CommandStatus::Failed));
    }

    #[test]
    fn test_unknown_command_ignored_by_default() {
        let command = Command::new(CommandId::GetNumberTrajectories, vec![4u16]);
        let shared = shared(&command, vec![(4, 1)], 1);

        let outcome = shared.process_reply(reply(4, 1, ResponseCode::UnknownCommand));
        assert_eq!(outcome, ReplyOutcome::Terminal(CommandStatus::Done));
    }

    #[test]
    fn test_unknown_command_fails_when_not_ignored() {
        let command =
            Command::new(CommandId::GetNumberTrajectories, vec![4u16]).ignore_unknown(false);
        let shared = shared(&command, vec![(4, 1)], 1);

        let outcome = shared.process_reply(reply(4, 1, ResponseCode::UnknownCommand));
        assert_eq!(outcome, ReplyOutcome::Terminal(CommandStatus::Failed));
    }

    #[test]
    fn test_foreign_uid_is_dropped() {
        let command = Command::new(CommandId::GetStatus, vec![4u16]);
        let shared = shared(&command, vec![(4, 1)], 1);

        assert_eq!(
            shared.process_reply(reply(4, 7, ResponseCode::CommandAccepted)),
            ReplyOutcome::Dropped
        );
        assert_eq!(shared.replies().len(), 0);
        assert_eq!(shared.status(), CommandStatus::Running);
    }

    #[test]
    fn test_replies_after_terminal_state_are_dropped() {
        let command = Command::new(CommandId::GetStatus, vec![4u16]);
        let shared = shared(&command, vec![(4, 1)], 1);
        shared.finish(CommandStatus::Cancelled);

        assert_eq!(
            shared.process_reply(reply(4, 1, ResponseCode::CommandAccepted)),
            ReplyOutcome::Dropped
        );
        // 终态不被后续回复改写
        assert_eq!(shared.status(), CommandStatus::Cancelled);
    }

    #[test]
    fn test_broadcast_quorum_completes_early() {
        let command = Command::broadcast(CommandId::GetStatus).with_expected_replies(2);
        let shared = shared(&command, vec![], 1);

        assert_eq!(
            shared.process_reply(reply(4, 0, ResponseCode::CommandAccepted)),
            ReplyOutcome::Recorded
        );
        assert_eq!(
            shared.process_reply(reply(8, 0, ResponseCode::CommandAccepted)),
            ReplyOutcome::Terminal(CommandStatus::Done)
        );
    }

    #[test]
    fn test_broadcast_timeout_with_replies_is_done() {
        let command = Command::broadcast(CommandId::GetStatus);
        let shared = shared(&command, vec![], 1);

        shared.process_reply(reply(4, 0, ResponseCode::CommandAccepted));
        assert_eq!(shared.timeout_status(), CommandStatus::Done);
    }

    #[test]
    fn test_broadcast_timeout_without_replies_times_out() {
        let command = Command::broadcast(CommandId::GetStatus);
        let shared = shared(&command, vec![], 1);
        assert_eq!(shared.timeout_status(), CommandStatus::TimedOut);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let command = Command::new(CommandId::GetStatus, vec![4u16]);
        let shared = shared(&command, vec![(4, 1)], 1);

        assert!(shared.finish(CommandStatus::TimedOut));
        assert!(!shared.finish(CommandStatus::Done));
        assert_eq!(shared.status(), CommandStatus::TimedOut);
    }

    #[test]
    fn test_wait_returns_on_terminal_transition() {
        use std::sync::Arc;
        let command = Command::new(CommandId::GetStatus, vec![4u16]);
        let shared = Arc::new(shared(&command, vec![(4, 1)], 1));

        let waiter = Arc::clone(&shared);
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(20));
        shared.process_reply(reply(4, 1, ResponseCode::CommandAccepted));

        assert_eq!(handle.join().unwrap(), CommandStatus::Done);
    }
}
