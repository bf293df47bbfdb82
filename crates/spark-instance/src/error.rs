//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义实例生命周期、并发闸门与分发路径上可能出现的全部错误；
//! - 以稳定错误码 + [`ErrorCategory`] 描述处置策略，调用方无需解析字符串即可区分
//!   “转换为调用故障”与“必须终止进程”两条路径。
//!
//! ## 设计要求（What）
//! - 所有错误类型通过 `thiserror::Error` 派生，兼容 `std::error::Error`；
//! - 非致命错误在分发层统一转换为 [`Fault`]，并交给 [`ErrorSink`](crate::sink::ErrorSink)；
//! - 分类为 [`ErrorCategory::Fatal`] 的错误经 [`escalate`] 以 [`FatalRuntimeError`] 为载荷重新抛出，
//!   绕过故障转换路径。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use crate::context::{ContextId, InstanceState};
use crate::contract::CallId;

/// 本 crate 使用的稳定错误码。
pub mod codes {
    /// 在 Closing/Closed/Faulted 的上下文上尝试绑定调用。
    pub const CONTEXT_CLOSED: &str = "instance.context_closed";
    /// 上下文未能在打开超时内完成打开。
    pub const OPEN_TIMEOUT: &str = "instance.open_timeout";
    /// 上下文级初始化钩子失败。
    pub const OPEN_FAILED: &str = "instance.open_failed";
    /// 端点未配置实例提供者。
    pub const NO_INSTANCE_PROVIDER: &str = "instance.no_provider";
    /// 实例提供者创建实例失败。
    pub const INSTANTIATION_FAILED: &str = "instance.instantiation_failed";
    /// 实例清理钩子失败。
    pub const RELEASE_FAILED: &str = "instance.release_failed";
    /// 上下文状态机拒绝了非法操作。
    pub const STATE_VIOLATION: &str = "instance.state_violation";
    /// 等待并发闸门期间调用被取消或超时。
    pub const ACQUIRE_CANCELLED: &str = "gate.acquire_cancelled";
    /// 独占模式下同一线程重入，继续等待必然死锁。
    pub const REENTRANCY_DENIED: &str = "gate.reentrancy_denied";
    /// 业务操作返回的失败。
    pub const OPERATION_FAILED: &str = "dispatch.operation_failed";
    /// 不可恢复的运行时条件。
    pub const FATAL: &str = "runtime.fatal";
}

/// 不可恢复条件的种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FatalKind {
    /// 内存耗尽。
    OutOfMemory,
    /// 栈空间耗尽或栈状态不可恢复。
    StackExhausted,
    /// 显式的进程中止信号。
    Abort,
}

/// 错误分类枚举，驱动分发层的处置策略。
///
/// # 契约说明（What）
/// - `Closed`：上下文已关闭或故障，调用被拒绝；
/// - `Timeout` / `Cancelled`：调用自身的截止时间或取消信号生效；
/// - `Configuration`：端点装配缺失（例如未配置实例提供者）；
/// - `Fatal`：不得转换为故障，必须经 [`escalate`] 重新抛出；
/// - `NonRetryable`：其余应用或实现层失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    NonRetryable,
    Closed,
    Timeout,
    Cancelled,
    Configuration,
    Fatal(FatalKind),
}

impl ErrorCategory {
    /// 是否属于必须终止进程的类别。
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCategory::Fatal(_))
    }
}

/// 底层原因，保持 `Send + Sync` 以便跨线程传递。
pub type ErrorCause = Box<dyn StdError + Send + Sync + 'static>;

/// 实例子系统的统一错误。
///
/// # 教案式说明
/// - **意图 (Why)**：上下文、闸门、提供者与业务操作的失败都汇入同一类型，分发层只需按
///   [`category`](Self::category) 决定“上报并转换为故障”还是“升级为进程终止”；
/// - **契约 (What)**：`code` 取自 [`codes`]，`message` 面向排障人员，`cause` 可选；
///   类型满足 `Send + Sync + 'static`；
/// - **执行 (How)**：各失败场景使用具名构造函数，保证错误码与分类成对出现。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct InstanceError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    #[source]
    cause: Option<ErrorCause>,
}

impl InstanceError {
    /// 以错误码、分类与消息构造错误。
    pub fn new(
        code: &'static str,
        category: ErrorCategory,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            category,
            cause: None,
        }
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 绑定到不再接受调用的上下文。
    pub fn context_closed(context: ContextId, state: InstanceState) -> Self {
        Self::new(
            codes::CONTEXT_CLOSED,
            ErrorCategory::Closed,
            format!("instance context {context} is {state:?} and no longer accepts calls"),
        )
    }

    /// 打开超时。
    pub fn open_timeout(context: ContextId, timeout: Duration) -> Self {
        Self::new(
            codes::OPEN_TIMEOUT,
            ErrorCategory::Timeout,
            format!("instance context {context} did not open within {timeout:?}"),
        )
    }

    /// 上下文初始化失败。
    pub fn open_failed(context: ContextId, detail: impl Into<Cow<'static, str>>) -> Self {
        let detail = detail.into();
        Self::new(
            codes::OPEN_FAILED,
            ErrorCategory::NonRetryable,
            format!("instance context {context} failed to open: {detail}"),
        )
    }

    /// 端点缺少实例提供者，等价于服务类型没有默认构造函数。
    pub fn no_instance_provider(context: ContextId) -> Self {
        Self::new(
            codes::NO_INSTANCE_PROVIDER,
            ErrorCategory::Configuration,
            format!(
                "no instance provider configured for instance context {context}: \
                 the service type has no default constructor"
            ),
        )
    }

    /// 提供者创建实例失败。
    pub fn instantiation_failed(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            codes::INSTANTIATION_FAILED,
            ErrorCategory::NonRetryable,
            detail,
        )
    }

    /// 清理钩子失败。
    pub fn release_failed(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::RELEASE_FAILED, ErrorCategory::NonRetryable, detail)
    }

    /// 状态机拒绝操作。
    pub fn state_violation(context: ContextId, detail: impl Into<Cow<'static, str>>) -> Self {
        let detail = detail.into();
        Self::new(
            codes::STATE_VIOLATION,
            ErrorCategory::NonRetryable,
            format!("instance context {context}: {detail}"),
        )
    }

    /// 等待闸门时被中止；`timed_out` 区分截止时间到期与显式取消。
    pub fn acquire_cancelled(call: CallId, timed_out: bool) -> Self {
        let (category, reason) = if timed_out {
            (ErrorCategory::Timeout, "deadline expired")
        } else {
            (ErrorCategory::Cancelled, "call cancelled")
        };
        Self::new(
            codes::ACQUIRE_CANCELLED,
            category,
            format!("{call} stopped waiting for the concurrency gate: {reason}"),
        )
    }

    /// 独占闸门上的同线程重入。
    pub fn reentrancy_denied(call: CallId) -> Self {
        Self::new(
            codes::REENTRANCY_DENIED,
            ErrorCategory::NonRetryable,
            format!(
                "{call} re-entered an exclusive instance from the thread holding it; \
                 waiting would deadlock"
            ),
        )
    }

    /// 业务操作失败。
    pub fn operation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::OPERATION_FAILED, ErrorCategory::NonRetryable, message)
    }

    /// 不可恢复条件。
    pub fn fatal(kind: FatalKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::FATAL, ErrorCategory::Fatal(kind), message)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 是否必须升级为进程终止。
    pub fn is_fatal(&self) -> bool {
        self.category.is_fatal()
    }
}

/// 调用方可见的故障，由非致命 [`InstanceError`] 转换而来。
///
/// # 契约说明（What）
/// - 只保留错误码、消息与分类，底层原因留在 [`ErrorSink`](crate::sink::ErrorSink) 一侧；
/// - 可克隆、可比较，便于协议层编码为故障响应。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct Fault {
    code: &'static str,
    message: String,
    category: ErrorCategory,
}

impl Fault {
    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }
}

impl From<&InstanceError> for Fault {
    fn from(error: &InstanceError) -> Self {
        Self {
            code: error.code(),
            message: error.message().to_owned(),
            category: error.category(),
        }
    }
}

impl From<InstanceError> for Fault {
    fn from(error: InstanceError) -> Self {
        Fault::from(&error)
    }
}

/// 升级路径上抛出的 panic 载荷。
///
/// 宿主若在 release profile 中配置 `panic = "abort"`，该载荷会直接终止进程；
/// 否则可在线程边界通过 `downcast_ref::<FatalRuntimeError>()` 识别。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("fatal runtime condition {kind:?} [{code}]: {message}")]
pub struct FatalRuntimeError {
    kind: FatalKind,
    code: &'static str,
    message: String,
}

impl FatalRuntimeError {
    pub fn kind(&self) -> FatalKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 将致命错误重新抛出，绕过故障转换。
///
/// 非致命错误误传至此时按 [`FatalKind::Abort`] 处理：调用点已经判定进程不可继续。
pub fn escalate(error: InstanceError) -> ! {
    let kind = match error.category() {
        ErrorCategory::Fatal(kind) => kind,
        _ => FatalKind::Abort,
    };
    tracing::error!(
        code = error.code(),
        kind = ?kind,
        "fatal runtime condition escalated: {}",
        error.message()
    );
    std::panic::panic_any(FatalRuntimeError {
        kind,
        code: error.code(),
        message: error.message().to_owned(),
    })
}
