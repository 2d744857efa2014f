//! 阶段定义与静态注册表
//!
//! 阶段顺序固定：schema-setup → content-migration → media-migration →
//! url-mappings → validation → cleanup。后面的阶段假定前面阶段写入的集合已经存在。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::RunContext;
use super::MigrationError;

/// 阶段名称（按注册顺序排列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseName {
    SchemaSetup,
    ContentMigration,
    MediaMigration,
    UrlMappings,
    Validation,
    Cleanup,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::SchemaSetup => "schema-setup",
            PhaseName::ContentMigration => "content-migration",
            PhaseName::MediaMigration => "media-migration",
            PhaseName::UrlMappings => "url-mappings",
            PhaseName::Validation => "validation",
            PhaseName::Cleanup => "cleanup",
        }
    }

    /// 返回所有阶段（按执行顺序）
    pub fn all_ordered() -> [PhaseName; 6] {
        [
            PhaseName::SchemaSetup,
            PhaseName::ContentMigration,
            PhaseName::MediaMigration,
            PhaseName::UrlMappings,
            PhaseName::Validation,
            PhaseName::Cleanup,
        ]
    }

    /// 在注册顺序中的位置
    pub fn index(&self) -> usize {
        Self::all_ordered()
            .iter()
            .position(|p| p == self)
            .unwrap_or(usize::MAX)
    }

    pub fn description(&self) -> &'static str {
        match self {
            PhaseName::SchemaSetup => "Create destination collections if they do not exist",
            PhaseName::ContentMigration => "Migrate posts, categories and tags",
            PhaseName::MediaMigration => "Upload media assets and record their new locations",
            PhaseName::UrlMappings => "Record old-to-new URL mappings for redirects",
            PhaseName::Validation => "Validate migrated content against the source corpus",
            PhaseName::Cleanup => "Remove temporary migration state",
        }
    }

    /// 默认是否为必需阶段
    ///
    /// 必需阶段失败会中止运行并触发全量回滚；可选阶段失败只追加一条告警。
    pub fn default_required(&self) -> bool {
        matches!(self, PhaseName::SchemaSetup | PhaseName::ContentMigration)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        PhaseName::all_ordered()
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| MigrationError::Configuration(format!("未知的阶段名称: {}", s)))
    }
}

/// 阶段定义（不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: PhaseName,
    pub description: String,
    pub required: bool,
}

impl Phase {
    pub fn new(name: PhaseName) -> Self {
        Self {
            name,
            description: name.description().to_string(),
            required: name.default_required(),
        }
    }
}

/// 阶段的领域逻辑
///
/// 具体迁移工作（内容转换、媒体上传、校验规则）由外部协作者实现，
/// 执行器只负责计时与错误捕获。处理器通过 `RunContext` 汇报统计和告警。
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn run(&self, ctx: &mut RunContext) -> Result<(), MigrationError>;
}

/// 同步闭包处理器
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> PhaseHandler for FnHandler<F>
where
    F: Fn(&mut RunContext) -> Result<(), MigrationError> + Send + Sync,
{
    async fn run(&self, ctx: &mut RunContext) -> Result<(), MigrationError> {
        (self.0)(ctx)
    }
}

/// 用同步闭包构造处理器
pub fn handler_fn<F>(f: F) -> Arc<dyn PhaseHandler>
where
    F: Fn(&mut RunContext) -> Result<(), MigrationError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// 已解析的阶段：定义 + 处理器
#[derive(Clone)]
pub struct RegisteredPhase {
    pub phase: Phase,
    handler: Option<Arc<dyn PhaseHandler>>,
}

impl RegisteredPhase {
    pub fn handler(&self) -> Option<&Arc<dyn PhaseHandler>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for RegisteredPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredPhase")
            .field("phase", &self.phase)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

/// 阶段注册表（启动时解析，运行期间不可变）
#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    phases: Vec<RegisteredPhase>,
}

impl PhaseRegistry {
    pub fn builder() -> PhaseRegistryBuilder {
        PhaseRegistryBuilder::default()
    }

    /// 按执行顺序返回阶段
    pub fn phases(&self) -> &[RegisteredPhase] {
        &self.phases
    }

    pub fn get(&self, name: PhaseName) -> Option<&RegisteredPhase> {
        self.phases.iter().find(|p| p.phase.name == name)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// 注册表构建器
#[derive(Default)]
pub struct PhaseRegistryBuilder {
    handlers: HashMap<PhaseName, Arc<dyn PhaseHandler>>,
    required: HashMap<PhaseName, bool>,
}

impl PhaseRegistryBuilder {
    /// 绑定阶段处理器（同名重复绑定时后者覆盖前者）
    pub fn handler(mut self, name: PhaseName, handler: Arc<dyn PhaseHandler>) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    /// 覆盖阶段的必需性
    pub fn required(mut self, name: PhaseName, required: bool) -> Self {
        self.required.insert(name, required);
        self
    }

    /// 解析注册表
    ///
    /// 必需阶段缺少处理器时返回 `Configuration` 错误；
    /// 可选阶段缺少处理器时保留为空，执行时记为跳过。
    pub fn build(mut self) -> Result<PhaseRegistry, MigrationError> {
        let mut phases = Vec::with_capacity(6);
        let mut missing = Vec::new();

        for name in PhaseName::all_ordered() {
            let mut phase = Phase::new(name);
            if let Some(required) = self.required.get(&name) {
                phase.required = *required;
            }
            let handler = self.handlers.remove(&name);
            if handler.is_none() && phase.required {
                missing.push(name.as_str());
            }
            phases.push(RegisteredPhase { phase, handler });
        }

        if !missing.is_empty() {
            return Err(MigrationError::Configuration(format!(
                "必需阶段缺少处理器: {}",
                missing.join(", ")
            )));
        }

        Ok(PhaseRegistry { phases })
    }
}
