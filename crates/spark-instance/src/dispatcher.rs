//! # Dispatcher：调用分发与实例行为编排
//!
//! ## 核心意图（Why）
//! - 对上层只暴露 `dispatch(call) -> Result<T, Fault>` 与会话信号，隐藏上下文解析、打开、
//!   绑定、并发闸门与实例创建的全部顺序约束；
//! - 非致命错误统一经 [`ErrorSink`] 上报并转换为 [`Fault`]，致命错误绕过故障路径直接升级。
//!
//! ## 调用顺序（What）
//! 1. [`SessionBinder::resolve`] 解析或创建上下文；
//! 2. [`InstanceContext::ensure_open`]；
//! 3. [`CallBinding::bind`]；
//! 4. 闸门获取（可能阻塞）；
//! 5. [`InstanceContext::get_or_create_instance`]；
//! 6. 执行业务操作；
//! 7. 释放许可；8. 解绑。第 7、8 步由 [`CallBinding`] 保证在任何路径上恰好执行一次。
//!
//! ## 风险提示（Trade-offs）
//! - 业务操作的 panic 不会被捕获：绑定守卫在展开路径上完成配对后 panic 继续向上传播；
//! - 操作期间持有的实例引用在解绑前释放，清理钩子因此能拿到唯一的强引用。

use std::fmt;
use std::sync::Arc;

use crate::binder::SessionBinder;
use crate::binding::CallBinding;
use crate::config::{ConfigError, EndpointConfig};
use crate::context::{InstanceContext, ReleaseHook};
use crate::contract::{CallContext, SessionId};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSnapshot, EndpointDiagnostics};
use crate::error::{Fault, InstanceError};
use crate::provider::{ContextInitializer, InstanceProvider};
use crate::sink::{self, ErrorSink, TracingErrorSink};

/// 单个端点的调用分发器。
///
/// `S` 为服务实例类型，`R` 为已反序列化的请求类型。
pub struct Dispatcher<S, R> {
    config: EndpointConfig,
    binder: SessionBinder<S>,
    provider: Option<Arc<dyn InstanceProvider<S, R>>>,
    initializer: Option<Arc<dyn ContextInitializer<S>>>,
    sink: Arc<dyn ErrorSink>,
    diagnostics: Arc<EndpointDiagnostics>,
}

impl<S, R> fmt::Debug for Dispatcher<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("binder", &self.binder)
            .field("has_provider", &self.provider.is_some())
            .field("has_initializer", &self.initializer.is_some())
            .finish_non_exhaustive()
    }
}

/// [`Dispatcher`] 构造器。
///
/// # 教案式说明
/// - **意图 (Why)**：配置、提供者、初始化钩子与错误出口来源不同，逐项注入后一次性校验；
/// - **契约 (What)**：`build` 先执行 [`EndpointConfig::validate`]，失败返回 [`ConfigError`]；
///   未指定错误出口时使用 [`TracingErrorSink`]；未指定提供者不会在构造期报错，而是在首次
///   取实例时以 `instance.no_provider` 暴露。
pub struct DispatcherBuilder<S, R> {
    config: EndpointConfig,
    provider: Option<Arc<dyn InstanceProvider<S, R>>>,
    initializer: Option<Arc<dyn ContextInitializer<S>>>,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl<S, R> DispatcherBuilder<S, R>
where
    S: Send + Sync + 'static,
    R: 'static,
{
    pub fn provider(mut self, provider: Arc<dyn InstanceProvider<S, R>>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn initializer(mut self, initializer: Arc<dyn ContextInitializer<S>>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Dispatcher<S, R>, ConfigError> {
        self.config.validate()?;

        let diagnostics = Arc::new(EndpointDiagnostics::new(self.config.name()));
        let release_hook = self.provider.clone().map(|provider| {
            let hook: ReleaseHook<S> =
                Arc::new(move |instance: Arc<S>| provider.release_instance(instance));
            hook
        });
        let binder = SessionBinder::new(
            self.config.instance_context_mode(),
            self.config.concurrency_mode(),
        )
        .with_release_hook(release_hook)
        .with_diagnostics(Arc::downgrade(&diagnostics));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingErrorSink::for_endpoint(self.config.name())));

        tracing::debug!(
            endpoint = self.config.name(),
            instance_context_mode = ?self.config.instance_context_mode(),
            concurrency_mode = ?self.config.concurrency_mode(),
            open_timeout = ?self.config.open_timeout(),
            "dispatcher configured"
        );

        Ok(Dispatcher {
            config: self.config,
            binder,
            provider: self.provider,
            initializer: self.initializer,
            sink,
            diagnostics,
        })
    }
}

impl<S, R> Dispatcher<S, R>
where
    S: Send + Sync + 'static,
    R: 'static,
{
    pub fn builder(config: EndpointConfig) -> DispatcherBuilder<S, R> {
        DispatcherBuilder {
            config,
            provider: None,
            initializer: None,
            sink: None,
        }
    }

    /// 在实例上执行一次调用。
    ///
    /// # 契约说明（What）
    /// - **参数**：`call` 描述调用身份、会话与中止条件；`operation` 以共享借用访问实例；
    /// - **返回值**：操作的结果，或经错误出口上报后的 [`Fault`]；
    /// - **后置条件**：无论成功、失败还是 panic，绑定与许可都已成对释放；
    /// - **致命错误**：类别为 `Fatal` 的错误不会转换为 `Fault`，而是升级为 panic。
    pub fn dispatch<T, F>(&self, call: &CallContext, request: &R, operation: F) -> Result<T, Fault>
    where
        F: FnOnce(&S, &R) -> Result<T, InstanceError>,
    {
        let span = tracing::info_span!(
            "spark_instance.dispatch",
            endpoint = self.config.name(),
            call_id = %call.call_id(),
            session = call.session().map(SessionId::as_str),
        );
        let _entered = span.enter();

        self.run(call, request, operation)
            .map_err(|error| self.fail(error))
    }

    fn run<T, F>(&self, call: &CallContext, request: &R, operation: F) -> Result<T, InstanceError>
    where
        F: FnOnce(&S, &R) -> Result<T, InstanceError>,
    {
        let context = self.binder.resolve(call);
        context.ensure_open(self.config.open_timeout(), self.initializer.as_deref())?;

        let mut binding = CallBinding::bind(Arc::clone(&context), call, Arc::clone(&self.sink))?;
        binding.acquire(call)?;

        let instance = context.get_or_create_instance(self.provider.as_deref(), request)?;
        let outcome = operation(&instance, request);
        drop(instance);

        binding.complete();
        outcome
    }

    fn fail(&self, error: InstanceError) -> Fault {
        let fault = Fault::from(&error);
        sink::route(self.sink.as_ref(), error);
        self.diagnostics.record(DiagnosticEvent::FaultReported);
        fault
    }

    /// 会话开始信号。
    pub fn on_session_start(&self, session: impl Into<SessionId>) {
        self.binder.on_session_start(&session.into());
    }

    /// 会话结束信号；清理钩子的错误交给错误出口。
    pub fn on_session_end(&self, session: impl Into<SessionId>) {
        if let Err(error) = self.binder.on_session_end(&session.into()) {
            sink::route(self.sink.as_ref(), error);
        }
    }

    /// 关闭全部存活上下文；仍有调用绑定的上下文在最后一次解绑时关闭。
    pub fn shutdown(&self) {
        tracing::info!(endpoint = self.config.name(), "dispatcher shutting down");
        for error in self.binder.shutdown() {
            sink::route(self.sink.as_ref(), error);
        }
    }

    /// 查找调用将落到的已存在上下文，不创建。
    pub fn context_for(&self, call: &CallContext) -> Option<Arc<InstanceContext<S>>> {
        self.binder.lookup(call)
    }

    pub fn session_count(&self) -> usize {
        self.binder.session_count()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }
}
