use crate::context::ValueContext;
use crate::error::PipelineError;
use async_trait::async_trait;

/// 流水线处理器抽象。
///
/// 处理器按注册顺序执行；返回错误时当前条目被放弃，下一条照常处理。
#[async_trait]
pub trait ValueProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError>;
}
