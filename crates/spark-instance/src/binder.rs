//! # SessionBinder：按实例上下文模式为调用解析上下文
//!
//! ## 核心意图（Why）
//! - 把“调用应当落在哪个 [`InstanceContext`] 上”的判定集中在一处，分发器无需感知模式差异；
//! - 会话仓储基于 `DashMap`，多个工作线程并发解析时只在分片粒度上竞争。
//!
//! ## 行为契约（What）
//! - `PerCall`：每次解析都构造新上下文，无查找结构；
//! - `PerSession`：以 [`SessionId`] 为键；首个调用或 `on_session_start` 惰性建档，
//!   `on_session_end` 移除条目并关闭上下文（仍有绑定时延迟至最后一次解绑）；
//!   未携带会话标识的调用按 `PerCall` 处理；
//! - `Single`：首个调用以双重检查创建唯一上下文，直到 `shutdown`；
//! - 已故障的 `PerSession`/`Single` 上下文仍会被返回，由绑定阶段以 `ContextClosed` 拒绝。
//!
//! ## 风险提示（Trade-offs）
//! - 条目构造发生在 `DashMap` 分片锁内，上下文构造只分配内存，不执行任何外部回调；
//! - 不提供空闲会话的自动回收，会话结束信号由宿主负责送达。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{ConcurrencyMode, InstanceContextMode};
use crate::context::{ContextId, InstanceContext, ReleaseHook};
use crate::contract::{CallContext, SessionId};
use crate::diagnostics::{DiagnosticEvent, EndpointDiagnostics};
use crate::error::InstanceError;

enum Registry<S> {
    PerCall,
    PerSession(DashMap<SessionId, Arc<InstanceContext<S>>>),
    Single {
        context: OnceLock<Arc<InstanceContext<S>>>,
        creation: Mutex<()>,
    },
}

/// 调用到实例上下文的解析器。
///
/// # 教案式注释
/// - **意图 (Why)**：封装三种模式的查找结构，对外只暴露 `resolve` 与会话信号；
/// - **契约 (What)**：上下文标识在单个绑定器内单调递增；新建的上下文继承绑定器的
///   并发模式、清理钩子与诊断回指；
/// - **风险 (Trade-offs)**：`shutdown` 之后 `Single` 模式的上下文保持 `Closed`，后续调用
///   会得到 `ContextClosed`，不会重建。
pub struct SessionBinder<S> {
    mode: InstanceContextMode,
    concurrency: ConcurrencyMode,
    registry: Registry<S>,
    next_id: AtomicU64,
    release_hook: Option<ReleaseHook<S>>,
    diagnostics: Weak<EndpointDiagnostics>,
}

impl<S> fmt::Debug for SessionBinder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBinder")
            .field("mode", &self.mode)
            .field("concurrency", &self.concurrency)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl<S> SessionBinder<S> {
    pub fn new(mode: InstanceContextMode, concurrency: ConcurrencyMode) -> Self {
        let registry = match mode {
            InstanceContextMode::PerCall => Registry::PerCall,
            InstanceContextMode::PerSession => Registry::PerSession(DashMap::new()),
            InstanceContextMode::Single => Registry::Single {
                context: OnceLock::new(),
                creation: Mutex::new(()),
            },
        };
        Self {
            mode,
            concurrency,
            registry,
            next_id: AtomicU64::new(0),
            release_hook: None,
            diagnostics: Weak::new(),
        }
    }

    pub(crate) fn with_release_hook(mut self, hook: Option<ReleaseHook<S>>) -> Self {
        self.release_hook = hook;
        self
    }

    pub(crate) fn with_diagnostics(mut self, diagnostics: Weak<EndpointDiagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn mode(&self) -> InstanceContextMode {
        self.mode
    }

    /// 为调用解析（必要时创建）实例上下文。
    pub fn resolve(&self, call: &CallContext) -> Arc<InstanceContext<S>> {
        match &self.registry {
            Registry::PerCall => self.create(InstanceContextMode::PerCall, None),
            Registry::PerSession(sessions) => match call.session() {
                Some(session) => Arc::clone(
                    sessions
                        .entry(session.clone())
                        .or_insert_with(|| {
                            self.create(InstanceContextMode::PerSession, Some(session.clone()))
                        })
                        .value(),
                ),
                None => self.create(InstanceContextMode::PerCall, None),
            },
            Registry::Single { context, creation } => {
                if let Some(existing) = context.get() {
                    return Arc::clone(existing);
                }
                let _creation = creation.lock();
                Arc::clone(context.get_or_init(|| self.create(InstanceContextMode::Single, None)))
            }
        }
    }

    /// 只查找、不创建；`PerCall` 与无会话调用始终返回 `None`。
    pub fn lookup(&self, call: &CallContext) -> Option<Arc<InstanceContext<S>>> {
        match &self.registry {
            Registry::PerCall => None,
            Registry::PerSession(sessions) => {
                let session = call.session()?;
                sessions.get(session).map(|entry| Arc::clone(entry.value()))
            }
            Registry::Single { context, .. } => context.get().cloned(),
        }
    }

    /// 会话开始信号：`PerSession` 下预先建档，其余模式忽略。
    pub fn on_session_start(&self, session: &SessionId) {
        if let Registry::PerSession(sessions) = &self.registry {
            let context = sessions.entry(session.clone()).or_insert_with(|| {
                self.create(InstanceContextMode::PerSession, Some(session.clone()))
            });
            tracing::debug!(session = %session, context = %context.id(), "session started");
        }
    }

    /// 会话结束信号：移除条目并请求关闭上下文。
    ///
    /// 返回值携带清理钩子的错误；未知会话视为已结束。
    pub fn on_session_end(&self, session: &SessionId) -> Result<(), InstanceError> {
        let Registry::PerSession(sessions) = &self.registry else {
            return Ok(());
        };
        match sessions.remove(session) {
            Some((_, context)) => {
                tracing::debug!(
                    session = %session,
                    context = %context.id(),
                    bound = context.bound_calls(),
                    "session ended"
                );
                context.close()
            }
            None => Ok(()),
        }
    }

    /// 关闭全部存活上下文，返回关闭过程中产生的错误。
    pub fn shutdown(&self) -> Vec<InstanceError> {
        let contexts: Vec<Arc<InstanceContext<S>>> = match &self.registry {
            Registry::PerCall => Vec::new(),
            Registry::PerSession(sessions) => {
                let keys: Vec<SessionId> =
                    sessions.iter().map(|entry| entry.key().clone()).collect();
                keys.iter()
                    .filter_map(|key| sessions.remove(key).map(|(_, context)| context))
                    .collect()
            }
            Registry::Single { context, .. } => context.get().cloned().into_iter().collect(),
        };

        tracing::debug!(mode = ?self.mode, contexts = contexts.len(), "binder shutting down");
        contexts
            .iter()
            .filter_map(|context| context.close().err())
            .collect()
    }

    /// 当前登记的会话数量；非 `PerSession` 模式恒为 0。
    pub fn session_count(&self) -> usize {
        match &self.registry {
            Registry::PerSession(sessions) => sessions.len(),
            _ => 0,
        }
    }

    fn create(
        &self,
        mode: InstanceContextMode,
        session: Option<SessionId>,
    ) -> Arc<InstanceContext<S>> {
        let id = ContextId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        if let Some(diagnostics) = self.diagnostics.upgrade() {
            diagnostics.record(DiagnosticEvent::ContextCreated);
        }
        tracing::trace!(context = %id, ?mode, "instance context created");
        Arc::new(
            InstanceContext::new(id, mode, self.concurrency)
                .with_session(session)
                .with_release_hook(self.release_hook.clone())
                .with_behavior(self.diagnostics.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InstanceState;
    use crate::contract::CallId;
    use std::time::Duration;

    fn session_call(id: u64, session: &str) -> CallContext {
        CallContext::new(id).with_session(session)
    }

    #[test]
    fn per_session_reuses_context_until_session_ends() {
        let binder: SessionBinder<()> =
            SessionBinder::new(InstanceContextMode::PerSession, ConcurrencyMode::Exclusive);

        let first = binder.resolve(&session_call(1, "alpha"));
        let second = binder.resolve(&session_call(2, "alpha"));
        let other = binder.resolve(&session_call(3, "beta"));
        assert!(Arc::ptr_eq(&first, &second), "同一会话应解析到同一上下文");
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(binder.session_count(), 2);

        binder
            .on_session_end(&SessionId::from("alpha"))
            .expect("结束会话不应失败");
        assert_eq!(first.state(), InstanceState::Closed);

        let fresh = binder.resolve(&session_call(4, "alpha"));
        assert!(!Arc::ptr_eq(&first, &fresh), "会话结束后应得到新上下文");
    }

    #[test]
    fn session_end_is_deferred_while_bound() {
        let binder: SessionBinder<()> =
            SessionBinder::new(InstanceContextMode::PerSession, ConcurrencyMode::Reentrant);
        binder.on_session_start(&SessionId::from("s"));
        let context = binder.resolve(&session_call(1, "s"));
        context
            .ensure_open(Duration::from_secs(1), None)
            .expect("打开应成功");
        context.bind(CallId::new(1)).expect("绑定应成功");

        binder
            .on_session_end(&SessionId::from("s"))
            .expect("结束会话不应失败");
        assert_eq!(context.state(), InstanceState::Opened);
        assert_eq!(binder.session_count(), 0);

        context.unbind(CallId::new(1)).expect("解绑应成功");
        assert_eq!(context.state(), InstanceState::Closed);
    }

    #[test]
    fn sessionless_call_on_per_session_endpoint_is_call_scoped() {
        let binder: SessionBinder<()> =
            SessionBinder::new(InstanceContextMode::PerSession, ConcurrencyMode::Exclusive);
        let context = binder.resolve(&CallContext::new(7));
        assert_eq!(context.mode(), InstanceContextMode::PerCall);
        assert!(binder.lookup(&CallContext::new(7)).is_none());
        assert_eq!(binder.session_count(), 0);
    }

    #[test]
    fn single_mode_returns_one_context_until_shutdown() {
        let binder: SessionBinder<()> =
            SessionBinder::new(InstanceContextMode::Single, ConcurrencyMode::Unrestricted);
        let first = binder.resolve(&CallContext::new(1));
        let second = binder.resolve(&session_call(2, "ignored"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), ContextId::new(1));

        assert!(binder.shutdown().is_empty());
        assert_eq!(first.state(), InstanceState::Closed);
        let after = binder.resolve(&CallContext::new(3));
        assert!(Arc::ptr_eq(&first, &after), "关停后不得重建单例上下文");
    }

    #[test]
    fn per_call_always_builds_fresh_contexts() {
        let binder: SessionBinder<()> =
            SessionBinder::new(InstanceContextMode::PerCall, ConcurrencyMode::Exclusive);
        let a = binder.resolve(&session_call(1, "s"));
        let b = binder.resolve(&session_call(2, "s"));
        assert_ne!(a.id(), b.id());
        assert!(binder.lookup(&session_call(3, "s")).is_none());
    }
}
