//! # CallBinding：单次调用与实例上下文之间的配对记录
//!
//! ## 核心意图（Why）
//! - 绑定/解绑、获取/释放必须严格成对，无论操作成功、返回错误还是 panic；
//! - 以 RAII 持有两者：构造即绑定，完成（显式 `complete` 或 `Drop`）即先释放许可、再解绑。
//!
//! ## 行为契约（What）
//! - 收尾恰好执行一次；
//! - 解绑产生的非致命错误交给 [`ErrorSink`]，致命错误升级；panic 展开期间只记录、不再升级，
//!   以免二次 panic 终止进程；
//! - 收尾错误从不改变调用本身的返回值。

use std::fmt;
use std::sync::Arc;
use std::thread;

use crate::context::InstanceContext;
use crate::contract::{CallContext, CallId};
use crate::error::InstanceError;
use crate::gate::GatePermit;
use crate::sink::{self, ErrorSink};

/// 调用绑定守卫。
#[must_use = "dropping a binding unbinds the call immediately"]
pub struct CallBinding<S> {
    call_id: CallId,
    context: Arc<InstanceContext<S>>,
    permit: Option<GatePermit>,
    sink: Arc<dyn ErrorSink>,
    completed: bool,
}

impl<S> fmt::Debug for CallBinding<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBinding")
            .field("call_id", &self.call_id)
            .field("context", &self.context.id())
            .field("holds_permit", &self.permit.is_some())
            .field("completed", &self.completed)
            .finish()
    }
}

impl<S> CallBinding<S> {
    /// 将调用绑定到上下文。
    ///
    /// 绑定失败时不产生守卫，也就不会有配对的解绑。
    pub fn bind(
        context: Arc<InstanceContext<S>>,
        call: &CallContext,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<Self, InstanceError> {
        context.bind(call.call_id())?;
        Ok(Self {
            call_id: call.call_id(),
            context,
            permit: None,
            sink,
            completed: false,
        })
    }

    /// 经上下文的闸门为调用获取许可；失败时守卫仍负责解绑。
    pub fn acquire(&mut self, call: &CallContext) -> Result<(), InstanceError> {
        if self.permit.is_none() {
            self.permit = Some(self.context.gate().acquire(call)?);
        }
        Ok(())
    }

    pub fn context(&self) -> &Arc<InstanceContext<S>> {
        &self.context
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// 正常路径上的显式收尾。
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;

        if let Some(permit) = self.permit.take() {
            permit.release();
        }

        if let Err(error) = self.context.unbind(self.call_id) {
            if thread::panicking() {
                tracing::error!(
                    call_id = %self.call_id,
                    context = %self.context.id(),
                    code = error.code(),
                    "unbind failed while unwinding: {}",
                    error.message()
                );
                if !error.is_fatal() {
                    self.sink.handle_error(&error);
                }
            } else {
                sink::route(self.sink.as_ref(), error);
            }
        }
    }
}

impl<S> Drop for CallBinding<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyMode, InstanceContextMode};
    use crate::context::{ContextId, InstanceState};
    use crate::error::codes;
    use crate::test_stubs::RecordingErrorSink;
    use std::panic::{self, AssertUnwindSafe};
    use std::time::Duration;

    fn opened(mode: InstanceContextMode) -> Arc<InstanceContext<()>> {
        let context = Arc::new(InstanceContext::new(
            ContextId::new(1),
            mode,
            ConcurrencyMode::Exclusive,
        ));
        context
            .ensure_open(Duration::from_secs(1), None)
            .expect("打开应成功");
        context
    }

    #[test]
    fn drop_releases_permit_then_unbinds() {
        let context = opened(InstanceContextMode::PerSession);
        let sink = Arc::new(RecordingErrorSink::default());
        let call = CallContext::new(1);

        let mut binding =
            CallBinding::bind(Arc::clone(&context), &call, sink.clone()).expect("绑定应成功");
        binding.acquire(&call).expect("空闲闸门应立即获取");
        assert_eq!(context.bound_calls(), 1);
        assert_eq!(context.gate().stats().depth, 1);

        drop(binding);
        let stats = context.gate().stats();
        assert_eq!(stats.acquired, stats.released);
        assert_eq!(stats.depth, 0);
        assert_eq!(context.bound_calls(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn unwinding_still_unbinds_per_call_context() {
        let context = opened(InstanceContextMode::PerCall);
        let sink = Arc::new(RecordingErrorSink::default());
        let call = CallContext::new(2);

        let result = panic::catch_unwind::<_, ()>(AssertUnwindSafe(|| {
            let mut binding = CallBinding::bind(Arc::clone(&context), &call, sink.clone())
                .expect("绑定应成功");
            binding.acquire(&call).expect("获取应成功");
            panic!("operation blew up");
        }));

        assert!(result.is_err());
        assert_eq!(context.bound_calls(), 0);
        assert_eq!(context.state(), InstanceState::Closed);
        assert_eq!(context.gate().stats().depth, 0);
    }

    #[test]
    fn bind_on_closed_context_fails_without_guard() {
        let context = opened(InstanceContextMode::PerSession);
        context.close().expect("关闭应成功");
        let sink = Arc::new(RecordingErrorSink::default());

        let err = CallBinding::bind(context, &CallContext::new(3), sink.clone())
            .expect_err("关闭的上下文拒绝绑定");
        assert_eq!(err.code(), codes::CONTEXT_CLOSED);
        assert!(sink.is_empty());
    }
}
