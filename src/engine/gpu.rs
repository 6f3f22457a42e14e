//! ### English
//! Trait seam over the host-owned GPU device.
//!
//! The GPU device/context is an external collaborator: the host creates and
//! owns it, and the engine only needs a narrow set of operations: render
//! textures, frame fences (or a completion query as the fallback), staging
//! textures for CPU readback, and a submit flush. `gl` implements the seam
//! over OpenGL via `glow`; `testing` provides scripted doubles for the
//! presentation tests.
//!
//! All calls that mutate GPU context state are serialized by the presentation
//! state machine (only one of Waiting/Publishing is ever active), so
//! implementations may assume one caller at a time per operation even though
//! the traits are `Send + Sync`.
//!
//! ### 中文
//! 宿主持有的 GPU 设备之上的 trait 接缝。
//!
//! GPU 设备/上下文是外部协作者：由宿主创建并持有，引擎只需要一组很窄的操作——
//! 渲染纹理、帧 fence（或作为回退的完成查询）、用于 CPU 回读的 staging 纹理、
//! 以及提交 flush。`gl` 通过 `glow` 在 OpenGL 上实现该接缝；`testing` 提供
//! 呈现测试所需的脚本化测试替身。
//!
//! 所有会修改 GPU 上下文状态的调用都由呈现状态机串行化（Waiting/Publishing
//! 任一时刻只有一个处于活动状态），因此即使 trait 是 `Send + Sync`，
//! 实现也可以假定每个操作同一时刻只有一个调用者。

pub mod gl;
pub mod testing;

use std::sync::Arc;

use dpi::PhysicalSize;

use crate::engine::error::EngineError;

/// ### English
/// Bytes per pixel for the engine's single supported pixel layout.
///
/// ### 中文
/// 引擎唯一支持的像素布局的每像素字节数。
pub const BYTES_PER_PIXEL: usize = 4;

/// ### English
/// Monotonic frame index. `0` is reserved for "no frame pending"; the first
/// signaled frame is `1`. Indices are never reused.
///
/// ### 中文
/// 单调递增的帧序号。`0` 保留表示“无待处理帧”；首个被 signal 的帧为 `1`。
/// 序号永不复用。
pub type FrameIndex = u64;

/// ### English
/// Pixel formats the swapchain/readback path understands.
///
/// ### 中文
/// 交换链/回读路径支持的像素格式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit BGRA, the host compositor's pixel-buffer format.
    Bgra8,
}

/// ### English
/// One GPU render texture owned by a swapchain slot.
///
/// ### 中文
/// 由交换链槽位持有的单个 GPU 渲染纹理。
pub trait GpuTexture: Send + Sync {
    fn size(&self) -> PhysicalSize<u32>;

    fn format(&self) -> PixelFormat;

    /// ### English
    /// Backend-native handle (GL texture name, D3D pointer, ...) used by the
    /// copy path and by the shared-texture publish strategy. `0` if the
    /// texture cannot be exported to the host.
    ///
    /// ### 中文
    /// 后端原生句柄（GL 纹理名、D3D 指针等），供拷贝路径与共享纹理发布策略使用。
    /// 纹理无法导出给宿主时为 `0`。
    fn native_handle(&self) -> u64;
}

/// ### English
/// GPU-timeline fence with monotonically increasing signal values.
///
/// `signal` is called on the render thread; `wait` is called on the
/// presentation worker (never the render thread in hardware-fence mode).
///
/// ### 中文
/// 基于 GPU 时间线、signal 值单调递增的 fence。
///
/// `signal` 在渲染线程调用；`wait` 在呈现 worker 线程调用
/// （硬件 fence 模式下永远不在渲染线程调用）。
pub trait FrameFence: Send + Sync {
    /// Inserts a GPU-side signal for `value` into the command stream.
    fn signal(&self, value: FrameIndex) -> Result<(), EngineError>;

    /// Blocks until the GPU has executed all work submitted before the
    /// signal for `value`.
    fn wait(&self, value: FrameIndex) -> Result<(), EngineError>;
}

/// ### English
/// Reusable completion query bracketing one frame's submission, the fallback
/// when hardware fences are unavailable.
///
/// ### 中文
/// 包裹单帧提交的可复用完成查询——硬件 fence 不可用时的回退方案。
pub trait CompletionQuery: Send {
    fn begin(&mut self) -> Result<(), EngineError>;

    fn end(&mut self) -> Result<(), EngineError>;

    /// Non-blocking poll: has the GPU executed past the query bracket?
    fn is_complete(&mut self) -> Result<bool, EngineError>;
}

/// ### English
/// CPU-readable staging texture mirroring a render texture.
///
/// ### 中文
/// 与渲染纹理对应的 CPU 可读 staging 纹理。
pub trait StagingTexture: Send {
    fn size(&self) -> PhysicalSize<u32>;

    fn format(&self) -> PixelFormat;

    /// ### English
    /// Maps the staging texture for CPU read and invokes `reader` with the
    /// mapped bytes and the row pitch (which may exceed `width *
    /// BYTES_PER_PIXEL` due to GPU alignment padding). Unmaps before
    /// returning.
    ///
    /// ### 中文
    /// 将 staging 纹理映射为 CPU 可读，并以映射后的字节与行距（row pitch，
    /// 可能因 GPU 对齐填充而超过 `width * BYTES_PER_PIXEL`）调用 `reader`。
    /// 返回前会取消映射。
    fn with_mapped(
        &mut self,
        reader: &mut dyn FnMut(&[u8], usize),
    ) -> Result<(), EngineError>;
}

/// ### English
/// The narrow GPU device contract consumed by the engine.
///
/// ### 中文
/// 引擎消费的窄 GPU 设备契约。
pub trait Device: Send + Sync {
    /// ### English
    /// Creates one swapchain render texture. `clear` requests zeroed initial
    /// contents (only the first slot of a swapchain is cleared).
    ///
    /// ### 中文
    /// 创建一个交换链渲染纹理。`clear` 表示请求清零的初始内容
    /// （交换链只有第一个槽位需要清零）。
    fn create_render_texture(
        &self,
        size: PhysicalSize<u32>,
        clear: bool,
    ) -> Result<Arc<dyn GpuTexture>, EngineError>;

    /// ### English
    /// Capability probe: returns a frame fence if the device supports GPU
    /// timeline fences, `None` otherwise. Called exactly once per
    /// render-target context, at `FrameFenceTracker` construction.
    ///
    /// ### 中文
    /// 能力探测：设备支持 GPU 时间线 fence 时返回一个帧 fence，否则返回
    /// `None`。每个渲染目标上下文只在 `FrameFenceTracker` 构造时调用一次。
    fn try_create_frame_fence(&self) -> Option<Box<dyn FrameFence>>;

    /// ### English
    /// Clears a render texture to `argb` (8-bit channels, alpha high byte).
    ///
    /// ### 中文
    /// 将渲染纹理清为 `argb`（8 位通道，alpha 在最高字节）。
    fn clear_render_texture(
        &self,
        texture: &dyn GpuTexture,
        argb: u32,
    ) -> Result<(), EngineError>;

    /// Creates the reusable completion query used in fallback mode.
    fn create_completion_query(&self) -> Result<Box<dyn CompletionQuery>, EngineError>;

    /// Creates a CPU-readable staging texture for readback.
    fn create_staging_texture(
        &self,
        size: PhysicalSize<u32>,
        format: PixelFormat,
    ) -> Result<Box<dyn StagingTexture>, EngineError>;

    /// ### English
    /// Issues a GPU-side copy from `source` into `staging`. The caller only
    /// maps `staging` after frame completion has been confirmed.
    ///
    /// ### 中文
    /// 发出从 `source` 到 `staging` 的 GPU 侧拷贝。调用方只会在帧完成已确认后
    /// 才映射 `staging`。
    fn copy_texture_to_staging(
        &self,
        source: &dyn GpuTexture,
        staging: &mut dyn StagingTexture,
    ) -> Result<(), EngineError>;

    /// Flushes recorded commands to the GPU (submit point).
    fn flush(&self);

    /// ### English
    /// Capability probe: can render textures be handed to the host
    /// compositor directly (shared-handle publish strategy)?
    ///
    /// ### 中文
    /// 能力探测：渲染纹理能否直接交给宿主合成器（共享句柄发布策略）？
    fn supports_shared_textures(&self) -> bool {
        false
    }
}
