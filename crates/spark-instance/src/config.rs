//! # 端点配置：实例上下文模式、并发模式与打开超时
//!
//! ## 核心意图（Why）
//! - 三项配置在端点装配时一次性确定，之后不可变；分发器在构造时校验并持有一份副本；
//! - 通过 `serde` 派生，宿主可以直接从 TOML/JSON 等配置源反序列化。
//!
//! ## 行为契约（What）
//! - 模式名称采用 kebab-case（`per-call`、`per-session`、`single`、`exclusive`、`reentrant`、
//!   `unrestricted`）；
//! - 打开超时以毫秒字段 `open_timeout_ms` 表示，缺省 60 秒，与通道默认关闭预算一致；
//! - [`EndpointConfig::validate`] 拒绝空端点名与零超时。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 未显式配置时的打开超时。
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// 实例上下文模式：实例生命周期与调用/会话/进程的对应关系。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceContextMode {
    /// 每次调用一个新的上下文，解绑时关闭。
    PerCall,
    /// 每个逻辑会话一个上下文，会话结束时关闭。
    #[default]
    PerSession,
    /// 进程内唯一上下文，首次调用时惰性创建，直到关停。
    Single,
}

impl InstanceContextMode {
    /// 上下文生命周期是否以单次调用为界。
    pub fn is_call_scoped(self) -> bool {
        matches!(self, InstanceContextMode::PerCall)
    }
}

/// 并发模式：同一实例上允许多少调用同时执行。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyMode {
    /// 串行化全部调用。
    #[default]
    Exclusive,
    /// 跨线程串行化，持有线程上的嵌套调用可重入。
    Reentrant,
    /// 不做串行化，实例自身需保证线程安全。
    Unrestricted,
}

/// 配置校验错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("endpoint name must not be empty")]
    EmptyName,
    #[error("open timeout of endpoint `{endpoint}` must be greater than zero")]
    ZeroOpenTimeout { endpoint: String },
}

/// 单个端点的实例行为配置。
///
/// # 教案式说明
/// - **意图 (Why)**：把分发器在构造时需要的全部配置收敛为一个值对象；
/// - **契约 (What)**：字段只能在构造阶段通过 `with_*` 设置，之后仅提供只读访问；
///   反序列化时缺省字段取 [`Default`] 的值，未知字段被拒绝；
/// - **执行 (How)**：`open_timeout` 经由 `duration_ms` 适配器与毫秒整数互转。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    name: String,
    instance_context_mode: InstanceContextMode,
    concurrency_mode: ConcurrencyMode,
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    open_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            instance_context_mode: InstanceContextMode::default(),
            concurrency_mode: ConcurrencyMode::default(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

impl EndpointConfig {
    /// 以端点名构造默认配置。
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_instance_context_mode(mut self, mode: InstanceContextMode) -> Self {
        self.instance_context_mode = mode;
        self
    }

    pub fn with_concurrency_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency_mode = mode;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_context_mode(&self) -> InstanceContextMode {
        self.instance_context_mode
    }

    pub fn concurrency_mode(&self) -> ConcurrencyMode {
        self.concurrency_mode
    }

    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// 校验配置是否可用于构造分发器。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::ZeroOpenTimeout {
                endpoint: self.name.clone(),
            });
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
