//! # InstanceContext：服务实例的所有者与生命周期状态机
//!
//! ## 核心意图（Why）
//! - 每个上下文恰好拥有零或一个服务实例，并以状态机约束“何时可以绑定调用、何时释放实例”；
//! - 上下文同时持有一个 [`ConcurrencyGate`]，二者共享生命周期。
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`Created → Opening → Opened → Closing → Closed`，另允许尚未打开的上下文
//!   `Created → Closing`；任何非终止态都可以进入 `Faulted`；
//! - `Closed` 与 `Faulted` 为终止态；`Closing`/`Closed`/`Faulted` 上的绑定以
//!   [`InstanceError::context_closed`] 拒绝；
//! - 绑定计数与状态只在上下文内部锁下修改；绑定计数大于零时上下文不会进入 `Closed`，
//!   关闭请求被延迟到最后一次解绑。
//!
//! ## 使用指南（How）
//! 1. [`ensure_open`](InstanceContext::ensure_open)：双重检查后执行一次打开；
//! 2. [`bind`](InstanceContext::bind) / [`unbind`](InstanceContext::unbind)：登记与注销调用；
//! 3. [`get_or_create_instance`](InstanceContext::get_or_create_instance)：首次访问时经提供者创建实例；
//! 4. [`close`](InstanceContext::close) / [`fault`](InstanceContext::fault)：由会话层或关停流程驱动。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{ConcurrencyMode, InstanceContextMode};
use crate::contract::{CallId, SessionId};
use crate::diagnostics::{DiagnosticEvent, EndpointDiagnostics};
use crate::error::InstanceError;
use crate::gate::ConcurrencyGate;
use crate::provider::{ContextInitializer, InstanceProvider};

/// 上下文关闭时调用的实例清理钩子。
pub type ReleaseHook<S> = Arc<dyn Fn(Arc<S>) -> Result<(), InstanceError> + Send + Sync>;

/// 上下文标识，由所属绑定器顺序分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// 上下文生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstanceState {
    Created = 0,
    Opening = 1,
    Opened = 2,
    Closing = 3,
    Closed = 4,
    Faulted = 5,
}

impl InstanceState {
    /// 判断是否允许跃迁至 `target`。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：只接受前向跃迁与进入 `Faulted`；终止态拒绝一切跃迁；
    /// - **执行 (How)**：匹配 `(self, target)` 元组实现有限状态机判定。
    pub fn can_transition_to(self, target: InstanceState) -> bool {
        use InstanceState::*;

        match (self, target) {
            (Created, Opening)
            | (Created, Closing)
            | (Opening, Opened)
            | (Opened, Closing)
            | (Closing, Closed) => true,
            (current, Faulted) => !current.is_terminal(),
            _ => false,
        }
    }

    /// 是否为终止态。
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Closed | InstanceState::Faulted)
    }

    /// 是否仍接受新的绑定。
    pub fn accepts_calls(self) -> bool {
        matches!(
            self,
            InstanceState::Created | InstanceState::Opening | InstanceState::Opened
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => InstanceState::Created,
            1 => InstanceState::Opening,
            2 => InstanceState::Opened,
            3 => InstanceState::Closing,
            4 => InstanceState::Closed,
            _ => InstanceState::Faulted,
        }
    }
}

#[derive(Debug)]
struct ContextInner<S> {
    state: InstanceState,
    bound_calls: usize,
    close_requested: bool,
    instance: Option<Arc<S>>,
}

/// 服务实例的生命周期所有者。
///
/// # 教案式说明
/// - **意图 (Why)**：为同一组调用（一次调用、一个会话或整个进程）提供唯一的实例归属点；
/// - **契约 (What)**：
///   - `inner` 锁保护状态、绑定计数、延迟关闭标记与实例引用；
///   - `state_hint` 是状态的原子镜像，只用于双重检查的快路径，真实判定总在锁内重读；
///   - `creation` 锁串行化实例创建，保证每个上下文至多创建一次实例；
///   - `behavior` 以 `Weak` 回指端点诊断信息，从不参与所有权；
/// - **风险 (Trade-offs)**：实例以 `Arc<S>` 暴露，`S` 需满足 `Send + Sync`；在 `Exclusive` 模式下
///   由闸门保证同一时刻只有一个调用使用它。
pub struct InstanceContext<S> {
    id: ContextId,
    mode: InstanceContextMode,
    session: Option<SessionId>,
    gate: Arc<ConcurrencyGate>,
    state_hint: AtomicU8,
    inner: Mutex<ContextInner<S>>,
    state_changed: Condvar,
    creation: Mutex<()>,
    release_hook: Option<ReleaseHook<S>>,
    behavior: Weak<EndpointDiagnostics>,
}

impl<S> fmt::Debug for InstanceContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("session", &self.session)
            .field("state", &self.state())
            .field("concurrency", &self.gate.mode())
            .finish_non_exhaustive()
    }
}

impl<S> InstanceContext<S> {
    /// 构造处于 `Created` 状态、尚未持有实例的上下文。
    pub fn new(id: ContextId, mode: InstanceContextMode, concurrency: ConcurrencyMode) -> Self {
        Self {
            id,
            mode,
            session: None,
            gate: Arc::new(ConcurrencyGate::new(concurrency)),
            state_hint: AtomicU8::new(InstanceState::Created as u8),
            inner: Mutex::new(ContextInner {
                state: InstanceState::Created,
                bound_calls: 0,
                close_requested: false,
                instance: None,
            }),
            state_changed: Condvar::new(),
            creation: Mutex::new(()),
            release_hook: None,
            behavior: Weak::new(),
        }
    }

    pub(crate) fn with_session(mut self, session: Option<SessionId>) -> Self {
        self.session = session;
        self
    }

    pub(crate) fn with_release_hook(mut self, hook: Option<ReleaseHook<S>>) -> Self {
        self.release_hook = hook;
        self
    }

    pub(crate) fn with_behavior(mut self, behavior: Weak<EndpointDiagnostics>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn mode(&self) -> InstanceContextMode {
        self.mode
    }

    /// 所属会话；仅 `PerSession` 上下文携带。
    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn state(&self) -> InstanceState {
        self.inner.lock().state
    }

    pub fn bound_calls(&self) -> usize {
        self.inner.lock().bound_calls
    }

    pub fn has_instance(&self) -> bool {
        self.inner.lock().instance.is_some()
    }

    /// 所属端点名；分发器已释放时返回 `None`。
    pub fn endpoint(&self) -> Option<String> {
        self.behavior
            .upgrade()
            .map(|diagnostics| diagnostics.endpoint().to_owned())
    }

    /// 确保上下文已打开。
    ///
    /// # 契约说明（What）
    /// - **快路径**：原子镜像显示 `Opened` 时直接返回；
    /// - **慢路径**：加锁后重读状态，仅 `Created` 的首个调用者推进到 `Opening` 并执行
    ///   `initializer`；其余观测到 `Opening` 的调用者在条件变量上等待；
    /// - **超时**：等待者在 `timeout` 内未见到打开完成时返回 [`InstanceError::open_timeout`]
    ///   并使上下文进入 `Faulted`；打开者同步执行 `initializer`，无法中途打断，
    ///   因此只在初始化返回后检查耗时：10ms 的上限遇到 50ms 的初始化，会在约 50ms 时失败；
    /// - **展开**：`initializer` panic 时上下文进入 `Faulted` 并唤醒等待者，panic 继续向上传播；
    /// - **失败**：初始化钩子的错误包装为 [`InstanceError::open_failed`] 并保留为 `source`，上下文进入 `Faulted`；
    /// - 任何路径返回时都不持有上下文锁。
    pub fn ensure_open(
        &self,
        timeout: Duration,
        initializer: Option<&dyn ContextInitializer<S>>,
    ) -> Result<(), InstanceError> {
        if self.state_hint() == InstanceState::Opened {
            return Ok(());
        }

        let started = Instant::now();
        let mut inner = self.inner.lock();
        loop {
            let state = inner.state;
            match state {
                InstanceState::Opened => return Ok(()),
                InstanceState::Created => break,
                InstanceState::Opening => {
                    let waited = self.state_changed.wait_until(&mut inner, started + timeout);
                    if waited.timed_out() && inner.state == InstanceState::Opening {
                        tracing::debug!(context = %self.id, ?timeout, "open wait timed out, faulting context");
                        if let Err(release_err) = self.fault_locked(inner) {
                            tracing::warn!(context = %self.id, code = release_err.code(), "instance release failed after open timeout");
                        }
                        return Err(InstanceError::open_timeout(self.id, timeout));
                    }
                }
                state => return Err(InstanceError::context_closed(self.id, state)),
            }
        }

        self.transition(&mut inner, InstanceState::Opening)?;
        drop(inner);

        let opening = OpeningGuard { context: self, armed: true };
        let setup = match initializer {
            Some(initializer) => initializer.initialize(self),
            None => Ok(()),
        };
        opening.disarm();
        let elapsed = started.elapsed();

        let mut inner = self.inner.lock();
        if inner.state != InstanceState::Opening {
            let state = inner.state;
            self.state_changed.notify_all();
            if state == InstanceState::Faulted && elapsed > timeout {
                // 等待者已按超时使上下文故障。
                return Err(InstanceError::open_timeout(self.id, timeout));
            }
            return Err(InstanceError::context_closed(self.id, state));
        }
        let outcome = match setup {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let detail = err.message().to_owned();
                Err(InstanceError::open_failed(self.id, detail).with_cause(err))
            }
            Ok(()) if elapsed > timeout => Err(InstanceError::open_timeout(self.id, timeout)),
            Ok(()) => Ok(()),
        };
        match outcome {
            Ok(()) => {
                self.transition(&mut inner, InstanceState::Opened)?;
                self.state_changed.notify_all();
                tracing::debug!(context = %self.id, ?elapsed, "instance context opened");
                Ok(())
            }
            Err(err) => {
                tracing::debug!(context = %self.id, ?elapsed, code = err.code(), "instance context failed to open");
                let released = self.fault_locked(inner);
                if let Err(release_err) = released {
                    tracing::warn!(context = %self.id, code = release_err.code(), "instance release failed after open failure");
                }
                Err(err)
            }
        }
    }

    /// 为调用登记绑定。
    pub fn bind(&self, call: CallId) -> Result<(), InstanceError> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_calls() {
            return Err(InstanceError::context_closed(self.id, inner.state));
        }
        inner.bound_calls += 1;
        tracing::trace!(context = %self.id, call_id = %call, bound = inner.bound_calls, "call bound");
        Ok(())
    }

    /// 注销调用绑定。
    ///
    /// # 契约说明（What）
    /// - 绑定计数归零且（模式为 `PerCall` 或已请求关闭）时执行 `Closing → Closed` 并调用清理钩子；
    /// - 计数归零时若上下文已 `Faulted`，释放仍持有的实例；
    /// - 清理钩子的错误作为返回值交给调用方上报，上下文仍然完成关闭；
    /// - 计数为零时解绑属于状态违例，计数不会下溢。
    pub fn unbind(&self, call: CallId) -> Result<(), InstanceError> {
        let mut inner = self.inner.lock();
        if inner.bound_calls == 0 {
            return Err(InstanceError::state_violation(
                self.id,
                format!("{call} unbound without a matching bind"),
            ));
        }
        inner.bound_calls -= 1;
        tracing::trace!(context = %self.id, call_id = %call, bound = inner.bound_calls, "call unbound");
        if inner.bound_calls > 0 {
            return Ok(());
        }

        let state = inner.state;
        let closing = self.mode.is_call_scoped() || inner.close_requested;
        match state {
            InstanceState::Faulted => {
                let instance = inner.instance.take();
                drop(inner);
                self.release(instance)
            }
            state if state.is_terminal() => Ok(()),
            _ if closing => self.close_locked(inner),
            _ => Ok(()),
        }
    }

    /// 请求关闭上下文；仍有调用绑定时延迟到最后一次解绑。
    pub fn close(&self) -> Result<(), InstanceError> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.state == InstanceState::Closing {
            return Ok(());
        }
        if inner.bound_calls > 0 || inner.state == InstanceState::Opening {
            inner.close_requested = true;
            tracing::debug!(context = %self.id, bound = inner.bound_calls, "instance context close deferred");
            return Ok(());
        }
        self.close_locked(inner)
    }

    /// 使上下文进入 `Faulted`；无调用绑定时立即释放实例。
    pub fn fault(&self) -> Result<(), InstanceError> {
        let inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Ok(());
        }
        self.fault_locked(inner)
    }

    /// 返回已持有的实例，或经提供者创建。
    ///
    /// # 契约说明（What）
    /// - 已持有实例时直接返回其共享引用；
    /// - 上下文不再接受调用（`Closing`/`Closed`/`Faulted`）时返回 [`InstanceError::context_closed`]，
    ///   不会为其创建新实例；
    /// - 未配置提供者返回 [`InstanceError::no_instance_provider`]；
    /// - 创建在 `creation` 锁下进行并二次检查，并发首次访问只会调用一次提供者；
    /// - 提供者失败时不保存任何状态，后续调用会再次尝试创建。
    pub fn get_or_create_instance<R>(
        &self,
        provider: Option<&dyn InstanceProvider<S, R>>,
        request: &R,
    ) -> Result<Arc<S>, InstanceError> {
        if let Some(instance) = self.held_instance()? {
            return Ok(instance);
        }
        let provider = provider.ok_or_else(|| InstanceError::no_instance_provider(self.id))?;

        let _creation = self.creation.lock();
        if let Some(instance) = self.held_instance()? {
            return Ok(instance);
        }

        tracing::debug!(context = %self.id, "get service instance start");
        let instance = Arc::new(provider.get_instance_for_request(self, request)?);
        tracing::debug!(context = %self.id, "get service instance stop");
        self.record(DiagnosticEvent::InstanceCreated);

        let mut inner = self.inner.lock();
        if !inner.state.accepts_calls() {
            // 创建期间上下文已关闭或故障，新实例不再挂到上下文上。
            let state = inner.state;
            drop(inner);
            if let Err(release_err) = self.release(Some(instance)) {
                tracing::warn!(
                    context = %self.id,
                    code = release_err.code(),
                    "releasing instance created for a closed context failed: {}",
                    release_err.message()
                );
            }
            return Err(InstanceError::context_closed(self.id, state));
        }
        inner.instance = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn held_instance(&self) -> Result<Option<Arc<S>>, InstanceError> {
        let inner = self.inner.lock();
        if !inner.state.accepts_calls() {
            return Err(InstanceError::context_closed(self.id, inner.state));
        }
        Ok(inner.instance.clone())
    }

    fn state_hint(&self) -> InstanceState {
        InstanceState::from_u8(self.state_hint.load(Ordering::Acquire))
    }

    fn transition(
        &self,
        inner: &mut ContextInner<S>,
        target: InstanceState,
    ) -> Result<(), InstanceError> {
        if !inner.state.can_transition_to(target) {
            return Err(InstanceError::state_violation(
                self.id,
                format!("transition {:?} -> {:?} is not permitted", inner.state, target),
            ));
        }
        inner.state = target;
        self.state_hint.store(target as u8, Ordering::Release);
        Ok(())
    }

    fn close_locked(&self, mut inner: MutexGuard<'_, ContextInner<S>>) -> Result<(), InstanceError> {
        self.transition(&mut inner, InstanceState::Closing)?;
        let instance = inner.instance.take();
        drop(inner);

        let released = self.release(instance);

        let mut inner = self.inner.lock();
        if inner.state == InstanceState::Closing {
            self.transition(&mut inner, InstanceState::Closed)?;
            self.record(DiagnosticEvent::ContextClosed);
            tracing::debug!(context = %self.id, "instance context closed");
        }
        self.state_changed.notify_all();
        released
    }

    fn fault_locked(&self, mut inner: MutexGuard<'_, ContextInner<S>>) -> Result<(), InstanceError> {
        self.transition(&mut inner, InstanceState::Faulted)?;
        self.record(DiagnosticEvent::ContextFaulted);
        tracing::debug!(context = %self.id, bound = inner.bound_calls, "instance context faulted");
        let instance = if inner.bound_calls == 0 {
            inner.instance.take()
        } else {
            None
        };
        drop(inner);
        self.state_changed.notify_all();
        self.release(instance)
    }

    fn release(&self, instance: Option<Arc<S>>) -> Result<(), InstanceError> {
        let Some(instance) = instance else {
            return Ok(());
        };
        self.record(DiagnosticEvent::InstanceReleased);
        let Some(hook) = &self.release_hook else {
            return Ok(());
        };
        hook(instance).map_err(|err| {
            if err.is_fatal() {
                err
            } else {
                let detail = format!("{}: {}", self.id, err.message());
                InstanceError::release_failed(detail).with_cause(err)
            }
        })
    }

    fn record(&self, event: DiagnosticEvent) {
        if let Some(diagnostics) = self.behavior.upgrade() {
            diagnostics.record(event);
        }
    }
}

/// 打开期间的展开守卫：`initializer` panic 时使上下文进入 `Faulted`。
struct OpeningGuard<'a, S> {
    context: &'a InstanceContext<S>,
    armed: bool,
}

impl<S> OpeningGuard<'_, S> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for OpeningGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let context = self.context;
        let inner = context.inner.lock();
        if inner.state != InstanceState::Opening {
            context.state_changed.notify_all();
            return;
        }
        tracing::error!(context = %context.id, "context initializer panicked, faulting context");
        if let Err(release_err) = context.fault_locked(inner) {
            tracing::warn!(context = %context.id, code = release_err.code(), "instance release failed while unwinding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::provider::FnProvider;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn context(mode: InstanceContextMode) -> InstanceContext<String> {
        InstanceContext::new(ContextId::new(1), mode, ConcurrencyMode::Exclusive)
    }

    #[test]
    fn per_call_context_closes_on_last_unbind() {
        let released = Arc::new(AtomicUsize::new(0));
        let hook: ReleaseHook<String> = {
            let released = Arc::clone(&released);
            Arc::new(move |_instance: Arc<String>| -> Result<(), InstanceError> {
                released.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let ctx = context(InstanceContextMode::PerCall).with_release_hook(Some(hook));
        let provider: FnProvider<_, ()> =
            FnProvider::new(|_: &InstanceContext<String>| Ok("svc".to_owned()));

        ctx.ensure_open(Duration::from_secs(1), None).expect("打开应成功");
        ctx.bind(CallId::new(1)).expect("绑定应成功");
        let instance = ctx
            .get_or_create_instance::<()>(Some(&provider), &())
            .expect("应创建实例");
        assert_eq!(instance.as_str(), "svc");
        drop(instance);

        ctx.unbind(CallId::new(1)).expect("解绑应成功");
        assert_eq!(ctx.state(), InstanceState::Closed);
        assert_eq!(released.load(Ordering::SeqCst), 1, "关闭时应调用清理钩子");
        assert!(!ctx.has_instance());

        let err = ctx.bind(CallId::new(2)).expect_err("关闭后的上下文不得再绑定");
        assert_eq!(err.code(), codes::CONTEXT_CLOSED);
    }

    #[test]
    fn close_is_deferred_while_calls_are_bound() {
        let ctx = context(InstanceContextMode::PerSession);
        ctx.ensure_open(Duration::from_secs(1), None).expect("打开应成功");
        ctx.bind(CallId::new(1)).expect("绑定应成功");

        ctx.close().expect("延迟关闭不应失败");
        assert_eq!(ctx.state(), InstanceState::Opened, "仍有绑定时不得关闭");

        ctx.unbind(CallId::new(1)).expect("解绑应成功");
        assert_eq!(ctx.state(), InstanceState::Closed);
    }

    #[test]
    fn unbind_without_bind_is_a_state_violation() {
        let ctx = context(InstanceContextMode::PerSession);
        let err = ctx.unbind(CallId::new(9)).expect_err("计数为零时解绑应失败");
        assert_eq!(err.code(), codes::STATE_VIOLATION);
        assert_eq!(ctx.bound_calls(), 0);
    }

    #[test]
    fn concurrent_openers_run_initializer_once() {
        let ctx = Arc::new(context(InstanceContextMode::Single));
        let runs = Arc::new(AtomicUsize::new(0));

        let openers: Vec<_> = (0..8)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    let initializer = move |_: &InstanceContext<String>| -> Result<(), InstanceError> {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        Ok(())
                    };
                    ctx.ensure_open(Duration::from_secs(2), Some(&initializer))
                })
            })
            .collect();

        for opener in openers {
            opener
                .join()
                .expect("打开线程不应 panic")
                .expect("所有调用者都应观测到已打开");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1, "初始化钩子只能执行一次");
        assert_eq!(ctx.state(), InstanceState::Opened);
    }

    #[test]
    fn slow_initializer_times_out_and_faults_context() {
        let ctx = context(InstanceContextMode::PerSession);
        let slow = |_: &InstanceContext<String>| -> Result<(), InstanceError> {
            thread::sleep(Duration::from_millis(30));
            Ok(())
        };
        let err = ctx
            .ensure_open(Duration::from_millis(5), Some(&slow))
            .expect_err("初始化超时应失败");
        assert_eq!(err.code(), codes::OPEN_TIMEOUT);
        assert_eq!(ctx.state(), InstanceState::Faulted);

        let err = ctx
            .ensure_open(Duration::from_millis(5), None)
            .expect_err("故障上下文不得重新打开");
        assert_eq!(err.code(), codes::CONTEXT_CLOSED);
    }

    #[test]
    fn missing_provider_is_a_configuration_error() {
        let ctx = context(InstanceContextMode::PerSession);
        let err = ctx
            .get_or_create_instance::<()>(None, &())
            .expect_err("缺少提供者应失败");
        assert_eq!(err.code(), codes::NO_INSTANCE_PROVIDER);
    }

    #[test]
    fn failed_creation_leaves_context_usable() {
        let ctx = context(InstanceContextMode::PerSession);
        let attempts = AtomicUsize::new(0);
        let provider: FnProvider<_, ()> = FnProvider::new(|_: &InstanceContext<String>| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(InstanceError::instantiation_failed("first attempt fails"))
            } else {
                Ok("second".to_owned())
            }
        });

        let err = ctx
            .get_or_create_instance::<()>(Some(&provider), &())
            .expect_err("首次创建失败");
        assert_eq!(err.code(), codes::INSTANTIATION_FAILED);
        let instance = ctx
            .get_or_create_instance::<()>(Some(&provider), &())
            .expect("第二次创建应成功");
        assert_eq!(instance.as_str(), "second");
    }

    fn failing_release() -> ReleaseHook<String> {
        Arc::new(|_instance: Arc<String>| -> Result<(), InstanceError> {
            Err(InstanceError::operation("pool rejected instance"))
        })
    }

    #[test]
    fn release_hook_error_is_reported_as_release_failed() {
        use std::error::Error as _;

        let ctx = context(InstanceContextMode::PerSession).with_release_hook(Some(failing_release()));
        let provider: FnProvider<_, ()> =
            FnProvider::new(|_: &InstanceContext<String>| Ok("svc".to_owned()));
        ctx.ensure_open(Duration::from_secs(1), None).expect("打开应成功");
        ctx.get_or_create_instance::<()>(Some(&provider), &())
            .expect("应创建实例");

        let err = ctx.close().expect_err("清理钩子失败应上报");
        assert_eq!(err.code(), codes::RELEASE_FAILED);
        assert!(err.message().contains("pool rejected instance"));
        let source = err.source().expect("应保留清理钩子的错误");
        assert!(source.to_string().contains(codes::OPERATION_FAILED));
        assert_eq!(ctx.state(), InstanceState::Closed, "清理失败不阻止关闭");
    }

    #[test]
    fn instance_created_for_closed_context_reports_context_closed() {
        let ctx = context(InstanceContextMode::PerSession).with_release_hook(Some(failing_release()));
        // 创建期间上下文被关闭。
        let provider: FnProvider<_, ()> = FnProvider::new(
            |context: &InstanceContext<String>| -> Result<String, InstanceError> {
                context.close()?;
                Ok("late".to_owned())
            },
        );
        ctx.ensure_open(Duration::from_secs(1), None).expect("打开应成功");

        let err = ctx
            .get_or_create_instance::<()>(Some(&provider), &())
            .expect_err("关闭的上下文不得挂载新实例");
        assert_eq!(err.code(), codes::CONTEXT_CLOSED, "清理失败不得掩盖调用失败的原因");
        assert!(!ctx.has_instance());
    }

    #[test]
    fn panicking_initializer_faults_context_and_wakes_waiters() {
        let ctx = context(InstanceContextMode::Single);
        let crashing = |_: &InstanceContext<String>| -> Result<(), InstanceError> {
            panic!("initializer crashed")
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.ensure_open(Duration::from_secs(5), Some(&crashing))
        }));
        assert!(result.is_err());
        assert_eq!(ctx.state(), InstanceState::Faulted);

        let started = Instant::now();
        let err = ctx
            .ensure_open(Duration::from_secs(5), None)
            .expect_err("故障上下文不得重新打开");
        assert_eq!(err.code(), codes::CONTEXT_CLOSED);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn transitions_only_move_forward_or_fault() {
        use InstanceState::*;

        assert!(Created.can_transition_to(Opening));
        assert!(Opened.can_transition_to(Closing));
        assert!(!Opened.can_transition_to(Opening));
        assert!(!Closing.can_transition_to(Opened));
        assert!(Closing.can_transition_to(Faulted));
        assert!(!Closed.can_transition_to(Faulted));
        assert!(!Faulted.can_transition_to(Closed));
    }
}
