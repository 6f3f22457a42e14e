//! ### English
//! Error taxonomy for the presentation pipeline.
//!
//! Capability absence (no hardware fences, no shared-texture export) is NOT an
//! error; it selects a degraded mode once at construction. Errors here are
//! the recoverable transient GPU failures and the terminal states; none of
//! them is allowed to cross the C ABI as anything other than a bool/null
//! sentinel.
//!
//! ### 中文
//! 呈现管线的错误分类。
//!
//! 能力缺失（无硬件 fence、无共享纹理导出）不是错误——它只在构造时一次性选择降级模式。
//! 这里的错误是可恢复的瞬时 GPU 失败与终止状态；它们跨越 C ABI 时只能表现为
//! bool/null 哨兵值。

use thiserror::Error;

/// ### English
/// Errors produced by the engine core.
///
/// ### 中文
/// 引擎核心产生的错误。
#[derive(Debug, Error)]
pub enum EngineError {
    /// ### English
    /// A GPU device/context call failed (device removed, out of memory, ...).
    /// Recovered locally by skipping the affected frame's publish.
    ///
    /// ### 中文
    /// GPU 设备/上下文调用失败（设备移除、显存不足等）。
    /// 本地恢复策略：跳过受影响帧的发布。
    #[error("gpu device call failed: {0}")]
    Device(String),

    /// ### English
    /// Mapping a staging texture for CPU read failed.
    ///
    /// ### 中文
    /// 将 staging 纹理映射为 CPU 可读失败。
    #[error("staging map failed: {0}")]
    Map(String),

    /// ### English
    /// The presentation pipeline is terminating; the operation was dropped.
    ///
    /// ### 中文
    /// 呈现管线正在终止；该操作已被丢弃。
    #[error("presentation pipeline is terminating")]
    Terminated,
}
