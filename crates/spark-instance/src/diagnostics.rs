//! 端点级诊断计数。
//!
//! 上下文只以 `Weak` 回指 [`EndpointDiagnostics`]，计数器从不参与所有权；分发器释放后，
//! 仍存活的上下文写计数会静默跳过。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 某一端点的运行计数器。
#[derive(Debug)]
pub struct EndpointDiagnostics {
    endpoint: Arc<str>,
    contexts_created: AtomicU64,
    contexts_closed: AtomicU64,
    contexts_faulted: AtomicU64,
    instances_created: AtomicU64,
    instances_released: AtomicU64,
    faults_reported: AtomicU64,
}

/// 某一时刻的计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub contexts_created: u64,
    pub contexts_closed: u64,
    pub contexts_faulted: u64,
    pub instances_created: u64,
    pub instances_released: u64,
    pub faults_reported: u64,
}

impl EndpointDiagnostics {
    pub fn new(endpoint: impl Into<Arc<str>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            contexts_created: AtomicU64::new(0),
            contexts_closed: AtomicU64::new(0),
            contexts_faulted: AtomicU64::new(0),
            instances_created: AtomicU64::new(0),
            instances_released: AtomicU64::new(0),
            faults_reported: AtomicU64::new(0),
        }
    }

    /// 端点名称，用于日志字段。
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            contexts_closed: self.contexts_closed.load(Ordering::Relaxed),
            contexts_faulted: self.contexts_faulted.load(Ordering::Relaxed),
            instances_created: self.instances_created.load(Ordering::Relaxed),
            instances_released: self.instances_released.load(Ordering::Relaxed),
            faults_reported: self.faults_reported.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record(&self, event: DiagnosticEvent) {
        let counter = match event {
            DiagnosticEvent::ContextCreated => &self.contexts_created,
            DiagnosticEvent::ContextClosed => &self.contexts_closed,
            DiagnosticEvent::ContextFaulted => &self.contexts_faulted,
            DiagnosticEvent::InstanceCreated => &self.instances_created,
            DiagnosticEvent::InstanceReleased => &self.instances_released,
            DiagnosticEvent::FaultReported => &self.faults_reported,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DiagnosticEvent {
    ContextCreated,
    ContextClosed,
    ContextFaulted,
    InstanceCreated,
    InstanceReleased,
    FaultReported,
}
