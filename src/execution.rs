//! 执行上下文
//!
//! 组件声明自己需要的执行后端，上下文在构建时一次性解析放置，之后不再逐次调用判断。

use crate::error::{Result, TextCnnError};
use serde::{Deserialize, Serialize};

/// 执行后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// CPU（ndarray）
    Cpu,
}

/// 组件的后端需求
pub trait Placement {
    /// 组件名称（用于日志和错误信息）
    fn component_name(&self) -> String;

    /// 组件必须运行的后端，None 表示任意后端均可
    fn required_backend(&self) -> Option<Backend> {
        None
    }
}

/// 显式构建的执行上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    backend: Backend,
    available: Vec<Backend>,
    parallel_filters: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ExecutionContext {
    /// CPU 上下文，默认并行计算不同宽度的卷积
    pub fn cpu() -> Self {
        Self {
            backend: Backend::Cpu,
            available: vec![Backend::Cpu],
            parallel_filters: true,
        }
    }

    pub fn with_parallel_filters(mut self, parallel: bool) -> Self {
        self.parallel_filters = parallel;
        self
    }

    /// 解析组件的放置
    ///
    /// 任何组件要求的后端不可用时返回错误。
    pub fn resolve(&self, components: &[&dyn Placement]) -> Result<Backend> {
        for component in components {
            if let Some(required) = component.required_backend() {
                if !self.available.contains(&required) {
                    return Err(TextCnnError::UnsupportedBackend {
                        component: component.component_name(),
                        required,
                        available: self.available.clone(),
                    });
                }
                tracing::debug!(component = %component.component_name(), ?required, "placed");
            }
        }
        Ok(self.backend)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn parallel_filters(&self) -> bool {
        self.parallel_filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pinned;

    impl Placement for Pinned {
        fn component_name(&self) -> String {
            "pinned".into()
        }

        fn required_backend(&self) -> Option<Backend> {
            Some(Backend::Cpu)
        }
    }

    struct Anywhere;

    impl Placement for Anywhere {
        fn component_name(&self) -> String {
            "anywhere".into()
        }
    }

    #[test]
    fn test_resolve_cpu() {
        let ctx = ExecutionContext::cpu();
        assert_eq!(ctx.resolve(&[&Pinned, &Anywhere]).unwrap(), Backend::Cpu);
    }

    #[test]
    fn test_resolve_unavailable() {
        let ctx = ExecutionContext {
            backend: Backend::Cpu,
            available: vec![],
            parallel_filters: false,
        };
        assert!(matches!(
            ctx.resolve(&[&Pinned]),
            Err(TextCnnError::UnsupportedBackend { .. })
        ));
        assert!(ctx.resolve(&[&Anywhere]).is_ok());
    }
}
