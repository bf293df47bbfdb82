//! # 调用契约：调用标识、会话标识、取消与截止原语
//!
//! ## 角色定位（Why）
//! - 分发管线交给本 crate 的每一次调用都携带一份 [`CallContext`]，其中的取消令牌与截止时间决定
//!   [`ConcurrencyGate`](crate::gate::ConcurrencyGate) 的等待何时放弃；
//! - 会话标识由外部传输/会话层给出，[`SessionBinder`](crate::binder::SessionBinder) 只负责据此查表。
//!
//! ## 行为契约（What）
//! - [`Cancellation`] 克隆后共享同一原子位，任何一方 `cancel()` 后所有视角都能观测到；
//! - [`Deadline`] 基于单调时钟 [`Instant`]，未设置时永不过期；
//! - 所有类型均满足 `Send + Sync`，可在工作线程之间自由传递。

use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

/// 单次入站调用的稳定标识，由传输层分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    /// 以传输层给出的序号构造调用标识。
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 返回原始序号。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for CallId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// 逻辑会话标识。
///
/// 内部以 `Arc<str>` 保存，克隆时不复制字符串，便于作为 `DashMap` 的 Key 在多线程间共享。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// 构造会话标识。
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// 字符串视图。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 取消令牌：跨线程共享的一次性取消标记。
///
/// # 契约说明（What）
/// - `cancel()` 首次触发返回 `true`，之后返回 `false`；
/// - `child()` 派生的令牌与父令牌共享同一原子位。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 标记取消；返回值表示本次调用是否为首次触发。
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// 截止原语，描述调用最迟完成的单调时间点。
///
/// # 契约说明（What）
/// - `Deadline::none()` 表示调用方未施加硬超时；
/// - 截止时间不会自行驱动取消，等待方需主动调用 [`is_expired`](Self::is_expired) 轮询。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 未设置截止时间。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 以绝对时间点构造。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以“当前时刻 + 持续时间”构造。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// 内部时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 是否已经超时。
    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// 距离截止时间的剩余时长；未设置时返回 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// 单次调用在本子系统内可见的全部上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：把“调用是谁、属于哪个会话、何时放弃”三件事收拢在一个只读视图里，
///   绑定、闸门与日志都只依赖这一份数据；
/// - **契约 (What)**：`session` 为空表示调用来自无会话的通道；取消令牌与截止时间默认均未触发；
/// - **执行 (How)**：通过 `with_*` 方法按需叠加，结构体本身可廉价克隆。
#[derive(Clone, Debug)]
pub struct CallContext {
    call_id: CallId,
    session: Option<SessionId>,
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    /// 以调用标识构造上下文。
    pub fn new(call_id: impl Into<CallId>) -> Self {
        Self {
            call_id: call_id.into(),
            session: None,
            cancellation: Cancellation::new(),
            deadline: Deadline::none(),
        }
    }

    /// 关联会话标识。
    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// 关联外部取消令牌（例如通道关闭时触发）。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 调用是否已被中止（取消或截止时间到期）。
    pub fn is_aborted(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_expired()
    }
}
