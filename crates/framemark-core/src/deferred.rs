//! 单次合并刷新
//!
//! 一个事件周期内的多次刷新请求只执行一次。

/// 延迟刷新任务
#[derive(Debug, Clone, Default)]
pub struct RefreshLater {
    pending: bool,
    requests: usize,
}

impl RefreshLater {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求刷新；返回是否为本周期的第一次请求
    pub fn schedule(&mut self) -> bool {
        self.requests += 1;
        !std::mem::replace(&mut self.pending, true)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// 本周期合并的请求数
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// 周期结束时取走任务；返回是否需要执行
    pub fn take(&mut self) -> bool {
        if !self.pending {
            return false;
        }
        tracing::trace!("Running deferred refresh for {} requests", self.requests);
        self.pending = false;
        self.requests = 0;
        true
    }
}
