//! 测试替身：记录型错误出口与计数型实例提供者。
//!
//! 供单元测试、集成测试与基准复用，生产代码不应依赖。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::InstanceContext;
use crate::error::{Fault, InstanceError};
use crate::provider::InstanceProvider;
use crate::sink::ErrorSink;

/// 记录所有上报错误的出口。
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    faults: Mutex<Vec<Fault>>,
}

impl RecordingErrorSink {
    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.faults.lock().iter().map(Fault::code).collect()
    }

    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn handle_error(&self, error: &InstanceError) {
        self.faults.lock().push(Fault::from(error));
    }
}

type Factory<S> = Box<dyn Fn(usize) -> S + Send + Sync>;

/// 统计创建与释放次数的实例提供者。
///
/// 工厂收到的参数是从 1 开始的创建序号。
pub struct CountingProvider<S> {
    factory: Factory<S>,
    attempts: AtomicUsize,
    created: AtomicUsize,
    released: AtomicUsize,
    fail_first: usize,
    delay: Option<Duration>,
}

impl<S> CountingProvider<S> {
    pub fn new(factory: impl Fn(usize) -> S + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            attempts: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            fail_first: 0,
            delay: None,
        }
    }

    /// 前 `attempts` 次创建返回 `instance.instantiation_failed`。
    pub fn failing_first(mut self, attempts: usize) -> Self {
        self.fail_first = attempts;
        self
    }

    /// 每次创建前休眠，用于放大并发首调的竞争窗口。
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<S, R> InstanceProvider<S, R> for CountingProvider<S>
where
    S: Send + Sync,
{
    fn get_instance(&self, _context: &InstanceContext<S>) -> Result<S, InstanceError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if attempt <= self.fail_first {
            return Err(InstanceError::instantiation_failed(format!(
                "attempt {attempt} rejected by stub"
            )));
        }
        let ordinal = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((self.factory)(ordinal))
    }

    fn release_instance(&self, instance: Arc<S>) -> Result<(), InstanceError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        drop(instance);
        Ok(())
    }
}
