//! ### English
//! Animation-runtime contract.
//!
//! The animation runtime is an external collaborator: the engine never loads
//! or interprets animation files itself. It drives runtimes through this
//! narrow trait: advance by elapsed time, draw into a frame's render sink,
//! bind/unbind a data context, route pointer input.
//!
//! ### 中文
//! 动画运行时契约。
//!
//! 动画运行时是外部协作者：引擎自身从不加载或解释动画文件。引擎通过这个窄
//! trait 驱动运行时——按流逝时间推进、绘制到帧的渲染汇、绑定/解绑数据上下文、
//! 转发指针输入。

use dpi::{PhysicalPosition, PhysicalSize};

/// ### English
/// Draw sink a runtime renders into for one frame. Backed by the frame's
/// swapchain slot; the runtime issues its own GPU work against the exposed
/// native texture.
///
/// ### 中文
/// 运行时单帧绘制的目标汇。由该帧的交换链槽位支撑；运行时针对暴露的原生纹理
/// 提交自己的 GPU 工作。
pub trait SceneRenderer {
    fn size(&self) -> PhysicalSize<u32>;

    /// Native handle of the texture being rendered into this frame.
    fn native_texture(&self) -> u64;
}

/// ### English
/// Pointer event forwarded from the host windowing layer.
///
/// ### 中文
/// 从宿主窗口层转发的指针事件。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub position: PhysicalPosition<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerKind {
    Down,
    Up,
    Move,
    Exit,
}

/// ### English
/// One registered animation scene. Implementations live on the host side of
/// the boundary (vtable-backed over FFI) or in tests.
///
/// ### 中文
/// 一个已注册的动画场景。实现位于边界的宿主一侧（FFI 上由 vtable 支撑）或测试中。
pub trait SceneRuntime: Send {
    /// ### English
    /// Advances the scene by `elapsed` seconds. Returns true while the scene
    /// still needs further advancing (animations running).
    ///
    /// ### 中文
    /// 将场景推进 `elapsed` 秒。场景仍需继续推进（动画进行中）时返回 true。
    fn advance(&mut self, elapsed: f64) -> bool;

    /// Draws the scene's current state into `renderer`.
    fn draw(&mut self, renderer: &mut dyn SceneRenderer);

    /// Binds the data context identified by the host-side token.
    fn bind_data_context(&mut self, token: u64);

    fn unbind_data_context(&mut self);

    fn pointer_event(&mut self, event: PointerEvent);
}
