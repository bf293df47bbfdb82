//! # ErrorSink：非致命错误的上报出口
//!
//! ## 角色定位（Why）
//! - 解绑、打开、实例创建、闸门获取与业务操作产生的非致命错误统一汇入 [`ErrorSink`]；
//! - 致命错误不进入出口，由 [`route`] 直接升级（见 [`escalate`]）。
//!
//! ## 契约（What）
//! - `handle_error` 为即发即弃，不得 panic，也不得阻塞调用路径；
//! - 默认实现 [`TracingErrorSink`] 以 `warn` 级别写入 `tracing`。

use crate::error::{InstanceError, escalate};

/// 非致命错误出口。
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, error: &InstanceError);
}

/// 以 `tracing::warn!` 记录错误的默认出口。
#[derive(Clone, Debug, Default)]
pub struct TracingErrorSink {
    endpoint: Option<String>,
}

impl TracingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在日志字段中附带端点名。
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
        }
    }
}

impl ErrorSink for TracingErrorSink {
    fn handle_error(&self, error: &InstanceError) {
        tracing::warn!(
            endpoint = self.endpoint.as_deref().unwrap_or("-"),
            code = error.code(),
            category = ?error.category(),
            "instance fault reported: {}",
            error.message()
        );
    }
}

impl<T> ErrorSink for T
where
    T: Fn(&InstanceError) + Send + Sync,
{
    fn handle_error(&self, error: &InstanceError) {
        self(error)
    }
}

/// 按类别分流：致命错误升级，其余交给出口。
pub(crate) fn route(sink: &dyn ErrorSink, error: InstanceError) {
    if error.is_fatal() {
        escalate(error);
    }
    sink.handle_error(&error);
}
