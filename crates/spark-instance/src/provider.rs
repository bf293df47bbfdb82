//! # 外部能力：实例提供者与上下文初始化钩子
//!
//! ## 角色定位（Why）
//! - 服务实例由应用提供，本 crate 只决定“何时创建、归谁所有、何时释放”；
//! - 端点装配时注入一个 [`InstanceProvider`]；缺失提供者属于配置错误，在首次取实例时以
//!   [`InstanceError::no_instance_provider`](crate::error::InstanceError::no_instance_provider) 暴露。
//!
//! ## 行为契约（What）
//! - `get_instance_for_request` 默认委托给 `get_instance`；
//! - `release_instance` 是可选的清理钩子，上下文关闭或故障时调用，默认直接丢弃实例；
//! - 提供者需满足 `Send + Sync`，同一提供者会被多个上下文并发调用。

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::InstanceContext;
use crate::error::InstanceError;

/// 服务实例提供者。
///
/// 泛型参数 `S` 为服务实例类型，`R` 为已反序列化的请求类型。
pub trait InstanceProvider<S, R>: Send + Sync {
    /// 为上下文创建实例。
    fn get_instance(&self, context: &InstanceContext<S>) -> Result<S, InstanceError>;

    /// 结合首个请求创建实例。
    fn get_instance_for_request(
        &self,
        context: &InstanceContext<S>,
        request: &R,
    ) -> Result<S, InstanceError> {
        let _ = request;
        self.get_instance(context)
    }

    /// 上下文关闭时释放实例。
    fn release_instance(&self, instance: Arc<S>) -> Result<(), InstanceError> {
        drop(instance);
        Ok(())
    }
}

/// 以闭包实现 [`InstanceProvider`]，适合无需清理钩子的场景。
pub struct FnProvider<F, R> {
    factory: F,
    _request: PhantomData<fn(&R)>,
}

impl<F, R> FnProvider<F, R> {
    pub fn new<S>(factory: F) -> Self
    where
        F: Fn(&InstanceContext<S>) -> Result<S, InstanceError> + Send + Sync,
    {
        Self {
            factory,
            _request: PhantomData,
        }
    }
}

impl<F, R> fmt::Debug for FnProvider<F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProvider").finish_non_exhaustive()
    }
}

impl<S, R, F> InstanceProvider<S, R> for FnProvider<F, R>
where
    F: Fn(&InstanceContext<S>) -> Result<S, InstanceError> + Send + Sync,
{
    fn get_instance(&self, context: &InstanceContext<S>) -> Result<S, InstanceError> {
        (self.factory)(context)
    }
}

/// 上下文级初始化钩子，在 `Opening` 阶段执行一次。
pub trait ContextInitializer<S>: Send + Sync {
    fn initialize(&self, context: &InstanceContext<S>) -> Result<(), InstanceError>;
}

impl<S, F> ContextInitializer<S> for F
where
    F: Fn(&InstanceContext<S>) -> Result<(), InstanceError> + Send + Sync,
{
    fn initialize(&self, context: &InstanceContext<S>) -> Result<(), InstanceError> {
        self(context)
    }
}
