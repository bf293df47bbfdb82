//! # ConcurrencyGate：按并发模式收窄同一实例上的调用并发度
//!
//! ## 核心意图（Why）
//! - 每个 [`InstanceContext`](crate::context::InstanceContext) 持有一个闸门，二者生命周期一致；
//! - 工作线程池上的调用可以任意交错，闸门把同一上下文上的执行收窄为配置声明的并发度。
//!
//! ## 行为契约（What）
//! - `Exclusive`：任一时刻至多一个调用持有闸门；等待者按 FIFO 票号依次获得；
//!   持有线程再次进入会被 [`InstanceError::reentrancy_denied`] 拒绝，而不是永久阻塞；
//! - `Reentrant`：跨线程与 `Exclusive` 相同；持有线程上的嵌套调用立即准入并增加深度，
//!   最外层许可释放时闸门才真正空闲；
//! - `Unrestricted`：获取与释放均不阻塞，只维护计数；
//! - 等待期间每 5ms 轮询一次调用的取消令牌与截止时间，中止的等待者离开队列并返回
//!   [`InstanceError::acquire_cancelled`]，不影响其他等待者。
//!
//! ## 风险提示（Trade-offs）
//! - 释放时 `notify_all` 唤醒全部等待者，仅队首能够前进；等待者数量极大时会有额外唤醒开销。
//! - [`GatePermit`] 不可跨线程移动：重入判定依赖持有线程的 [`ThreadId`]。

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::ConcurrencyMode;
use crate::contract::CallContext;
use crate::error::InstanceError;

const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Holder {
    owner: Option<ThreadId>,
    depth: u32,
    next_ticket: u64,
    queue: VecDeque<u64>,
}

impl Holder {
    fn take(&mut self, owner: ThreadId) {
        self.owner = Some(owner);
        self.depth = 1;
    }

    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.queue.push_back(ticket);
        ticket
    }

    fn is_turn_of(&self, ticket: u64) -> bool {
        self.owner.is_none() && self.queue.front() == Some(&ticket)
    }
}

/// 闸门计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    /// 成功获取的许可数（含重入）。
    pub acquired: u64,
    /// 已释放的许可数。
    pub released: u64,
    /// 因取消或超时放弃等待的次数。
    pub cancelled: u64,
    /// 当前持有深度；0 表示空闲。
    pub depth: u32,
    /// 当前排队的等待者数量。
    pub waiting: usize,
}

/// 单个实例上下文的并发闸门。
#[derive(Debug)]
pub struct ConcurrencyGate {
    mode: ConcurrencyMode,
    holder: Mutex<Holder>,
    handoff: Condvar,
    acquired: AtomicU64,
    released: AtomicU64,
    cancelled: AtomicU64,
}

impl ConcurrencyGate {
    pub fn new(mode: ConcurrencyMode) -> Self {
        Self {
            mode,
            holder: Mutex::new(Holder::default()),
            handoff: Condvar::new(),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    /// 为调用获取访问许可。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：调用已绑定到闸门所属的上下文；
    /// - **返回值**：成功时返回必须恰好释放一次的 [`GatePermit`]（显式 `release` 或 `Drop`）；
    ///   失败时闸门状态不变，调用未占有任何许可；
    /// - **阻塞**：`Exclusive`/`Reentrant` 下可能阻塞，直至轮到本调用或调用被中止。
    pub fn acquire(self: &Arc<Self>, call: &CallContext) -> Result<GatePermit, InstanceError> {
        if self.mode != ConcurrencyMode::Unrestricted {
            self.enter(call)?;
        }
        self.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(GatePermit {
            gate: Arc::clone(self),
            released: false,
            _thread_bound: PhantomData,
        })
    }

    fn enter(&self, call: &CallContext) -> Result<(), InstanceError> {
        let current = thread::current().id();
        let mut holder = self.holder.lock();

        if holder.owner == Some(current) {
            if self.mode == ConcurrencyMode::Reentrant {
                holder.depth += 1;
                tracing::trace!(call_id = %call.call_id(), depth = holder.depth, "gate re-entered");
                return Ok(());
            }
            return Err(InstanceError::reentrancy_denied(call.call_id()));
        }

        if holder.owner.is_none() && holder.queue.is_empty() {
            holder.take(current);
            return Ok(());
        }

        let ticket = holder.enqueue();
        loop {
            if holder.is_turn_of(ticket) {
                holder.queue.pop_front();
                holder.take(current);
                return Ok(());
            }
            if call.is_aborted() {
                holder.queue.retain(|queued| *queued != ticket);
                drop(holder);
                self.cancelled.fetch_add(1, Ordering::AcqRel);
                // 队首可能刚好是本票号，唤醒其余等待者重新判定。
                self.handoff.notify_all();
                let timed_out = !call.cancellation().is_cancelled();
                tracing::debug!(call_id = %call.call_id(), timed_out, "gate wait abandoned");
                return Err(InstanceError::acquire_cancelled(call.call_id(), timed_out));
            }
            let wait = call
                .deadline()
                .remaining()
                .map_or(CANCELLATION_POLL_INTERVAL, |left| {
                    left.min(CANCELLATION_POLL_INTERVAL)
                });
            self.handoff.wait_for(&mut holder, wait);
        }
    }

    fn leave(&self) {
        if self.mode == ConcurrencyMode::Unrestricted {
            return;
        }
        let mut holder = self.holder.lock();
        debug_assert_eq!(holder.owner, Some(thread::current().id()));
        holder.depth = holder.depth.saturating_sub(1);
        if holder.depth == 0 {
            holder.owner = None;
            drop(holder);
            self.handoff.notify_all();
        }
    }

    pub fn stats(&self) -> GateStats {
        let holder = self.holder.lock();
        GateStats {
            acquired: self.acquired.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            depth: holder.depth,
            waiting: holder.queue.len(),
        }
    }
}

/// 闸门访问许可。
///
/// 许可与获取它的线程绑定（`!Send`），释放恰好发生一次：显式 [`release`](Self::release)
/// 或离开作用域时的 `Drop`，包括 panic 展开路径。
#[derive(Debug)]
#[must_use = "dropping a permit releases the gate immediately"]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    released: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl GatePermit {
    /// 显式释放许可。
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.gate.released.fetch_add(1, Ordering::AcqRel);
        self.gate.leave();
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Cancellation, Deadline};
    use crate::error::{ErrorCategory, codes};
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "等待条件超时，闸门可能卡死"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn exclusive_waiters_are_served_in_fifo_order() {
        let gate = Arc::new(ConcurrencyGate::new(ConcurrencyMode::Exclusive));
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = gate.acquire(&CallContext::new(0)).expect("空闲闸门应立即获取");

        let mut workers = Vec::new();
        for id in 1..=2u64 {
            let worker_gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            workers.push(thread::spawn(move || {
                let permit = worker_gate
                    .acquire(&CallContext::new(id))
                    .expect("等待者最终应获取");
                order.lock().push(id);
                thread::sleep(Duration::from_millis(5));
                permit.release();
            }));
            let expected = id as usize;
            wait_until(|| gate.stats().waiting == expected);
        }

        held.release();
        for worker in workers {
            worker.join().expect("等待线程不应 panic");
        }
        assert_eq!(*order.lock(), vec![1, 2], "排队顺序应为 FIFO");
        let stats = gate.stats();
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 3);
        assert_eq!(stats.depth, 0);
    }

    #[test]
    fn reentrant_gate_tracks_depth_until_outermost_release() {
        let gate = Arc::new(ConcurrencyGate::new(ConcurrencyMode::Reentrant));
        let outer = gate.acquire(&CallContext::new(1)).expect("外层获取");
        let inner = gate.acquire(&CallContext::new(2)).expect("同线程重入应立即准入");
        assert_eq!(gate.stats().depth, 2);

        inner.release();
        assert_eq!(gate.stats().depth, 1, "内层释放后仍由外层持有");

        let contender = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let call = CallContext::new(3).with_deadline(Deadline::after(Duration::from_millis(30)));
                gate.acquire(&call).map(drop)
            })
        };
        let blocked = contender.join().expect("竞争线程不应 panic");
        assert!(blocked.is_err(), "外层未释放时其他线程必须阻塞");

        outer.release();
        assert_eq!(gate.stats().depth, 0);
    }

    #[test]
    fn cancelled_waiter_leaves_queue_without_holding_gate() {
        let gate = Arc::new(ConcurrencyGate::new(ConcurrencyMode::Exclusive));
        let held = gate.acquire(&CallContext::new(1)).expect("首个调用获取");
        let cancellation = Cancellation::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let call = CallContext::new(2).with_cancellation(cancellation.child());
            thread::spawn(move || gate.acquire(&call).map(drop))
        };
        wait_until(|| gate.stats().waiting == 1);
        cancellation.cancel();

        let err = waiter
            .join()
            .expect("等待线程不应 panic")
            .expect_err("取消后等待必须失败");
        assert_eq!(err.code(), codes::ACQUIRE_CANCELLED);
        assert_eq!(err.category(), ErrorCategory::Cancelled);

        let stats = gate.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.cancelled, 1);

        held.release();
        let next = gate.acquire(&CallContext::new(3)).expect("取消的等待者不应残留持有");
        drop(next);
        assert_eq!(gate.stats().depth, 0);
    }

    #[test]
    fn exclusive_reentry_is_rejected_instead_of_deadlocking() {
        let gate = Arc::new(ConcurrencyGate::new(ConcurrencyMode::Exclusive));
        let _held = gate.acquire(&CallContext::new(1)).expect("首个调用获取");
        let err = gate
            .acquire(&CallContext::new(2))
            .expect_err("同线程重入独占闸门应失败");
        assert_eq!(err.code(), codes::REENTRANCY_DENIED);
    }

    #[test]
    fn unrestricted_gate_never_blocks() {
        let gate = Arc::new(ConcurrencyGate::new(ConcurrencyMode::Unrestricted));
        let permits: Vec<_> = (0..3)
            .map(|id| gate.acquire(&CallContext::new(id)).expect("无限制闸门不应失败"))
            .collect();
        assert_eq!(gate.stats().acquired, 3);
        assert_eq!(gate.stats().depth, 0);
        drop(permits);
        assert_eq!(gate.stats().released, 3);
    }
}
