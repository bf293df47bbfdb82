#![deny(unsafe_code)]
#![doc = r#"
# spark-instance

## 设计动机（Why）
- **定位**：为 RPC 分发运行时回答三个问题：每个入站调用由哪个服务实例处理、该实例的
  生命周期如何与调用/会话对应、调用在实例上执行期间运行时保证怎样的并发语义。
- **架构角色**：位于传输、编解码与路由之后；到达本 crate 的调用已完成鉴权、路由与反序列化，
  请求载荷以泛型 `R` 表示。
- **设计理念**：生命周期以显式状态机约束，配对操作（绑定/解绑、获取/释放）以 RAII 守卫保证，
  错误以稳定错误码与 [`ErrorCategory`](crate::error::ErrorCategory) 分类处理。

## 核心契约（What）
- **实例上下文模式**：`PerCall`、`PerSession`、`Single`，见 [`InstanceContextMode`]；
- **并发模式**：`Exclusive`、`Reentrant`、`Unrestricted`，见 [`ConcurrencyMode`]；
- **调用入口**：[`Dispatcher::dispatch`] 返回操作结果或 [`Fault`]；致命错误以
  [`FatalRuntimeError`] 载荷 panic 升级；
- **外部能力**：[`InstanceProvider`] 提供实例，[`ErrorSink`] 接收非致命错误，
  [`ContextInitializer`] 在上下文打开时执行一次。

## 实现策略（How）
- 调用运行在宿主提供的工作线程上，本 crate 不自带运行时；
- 锁与条件变量采用 `parking_lot`，会话仓储采用 `dashmap`；
- 日志统一经 `tracing` 输出，每次分发一个 `spark_instance.dispatch` span。

## 风险与考量（Trade-offs）
- 可重入判定以线程身份为准，闸门许可因此不可跨线程移动；
- 发布配置建议开启 `panic = "abort"`，致命错误升级时直接终止进程。
"#]

pub mod binder;
pub mod binding;
pub mod config;
pub mod context;
pub mod contract;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod provider;
pub mod sink;
/// 测试替身命名空间，集中维护记录型错误出口与计数型提供者，供集成测试与基准复用。
pub mod test_stubs;

pub use binder::SessionBinder;
pub use binding::CallBinding;
pub use config::{ConcurrencyMode, ConfigError, EndpointConfig, InstanceContextMode};
pub use context::{ContextId, InstanceContext, InstanceState};
pub use contract::{CallContext, CallId, Cancellation, Deadline, SessionId};
pub use diagnostics::DiagnosticsSnapshot;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{ErrorCategory, FatalKind, FatalRuntimeError, Fault, InstanceError, codes};
pub use gate::{ConcurrencyGate, GatePermit, GateStats};
pub use provider::{ContextInitializer, FnProvider, InstanceProvider};
pub use sink::{ErrorSink, TracingErrorSink};
