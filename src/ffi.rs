//! ### English
//! C ABI surface for `vexel_native`.
//! All exported symbols are `extern "C"` functions; structs crossing the
//! boundary are `#[repr(C)]`. Strings passed from the host must be
//! NUL-terminated UTF-8. Every entry point null-checks its pointers and
//! returns a zero/null/false sentinel on caller misuse; no panic crosses the
//! boundary.
//!
//! ### 中文
//! `vexel_native` 的 C ABI 接口层。
//! 所有导出符号均为 `extern "C"` 函数；跨边界结构体使用 `#[repr(C)]`。
//! 宿主传入的字符串必须是 NUL 结尾的 UTF-8。每个入口都会对指针做空检查，
//! 调用方误用时返回零/null/false 哨兵值；不会有 panic 跨越边界。

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use dpi::{PhysicalPosition, PhysicalSize};

use crate::engine::context::{RendererContext, VendorHints};
use crate::engine::error::EngineError;
use crate::engine::gpu::gl::{GlDevice, GlProcLoader, MakeCurrentCallback};
use crate::engine::handles::RawHandle;
use crate::engine::layout::{
    ComputedLayout, LayoutConstraints, LayoutDirtyCallback, LayoutEngine, LayoutObserver,
    MeasureCallback,
};
use crate::engine::present::{FrameAvailableCallback, FrameObserver};
use crate::engine::scene::{PointerEvent, PointerKind, SceneRenderer, SceneRuntime};
use crate::engine::script::{ConsoleBuffer, ConsoleDataCallback, ScriptEngine, ScriptInterrupt};
use crate::engine::target::{FrameRenderer, LoadAction, RenderTarget};

/// ### English
/// C ABI version for `vexel_native`.
///
/// ### 中文
/// `vexel_native` 的 C ABI 版本号。
const VEXEL_NATIVE_ABI_VERSION: u32 = 1;

pub const VEXEL_NATIVE_POINTER_DOWN: u32 = 0;
pub const VEXEL_NATIVE_POINTER_UP: u32 = 1;
pub const VEXEL_NATIVE_POINTER_MOVE: u32 = 2;
pub const VEXEL_NATIVE_POINTER_EXIT: u32 = 3;

#[repr(C)]
/// ### English
/// Opaque renderer-context handle owning the scene table, the advance worker
/// pool, and the capability probe results.
///
/// ### 中文
/// 不透明渲染器上下文句柄，持有场景表、推进 worker 池与能力探测结果。
pub struct VexelRendererContext {
    context: RendererContext,
}

#[repr(C)]
/// ### English
/// Opaque render-target handle owning the swapchain and its presentation
/// worker.
///
/// ### 中文
/// 不透明渲染目标句柄，持有交换链及其呈现 worker。
pub struct VexelRenderTarget {
    target: RenderTarget,
}

#[repr(C)]
/// ### English
/// One in-progress frame, valid from `begin_frame` until the matching
/// `end_frame` consumes it.
///
/// ### 中文
/// 一个进行中的帧，从 `begin_frame` 起有效，直到对应的 `end_frame` 消费它。
pub struct VexelFrameRenderer {
    frame: FrameRenderer,
}

#[repr(C)]
/// ### English
/// Opaque console view passed to a script engine while it executes; only
/// valid for the duration of that call.
///
/// ### 中文
/// 脚本引擎执行期间传入的不透明控制台视图；仅在该次调用期间有效。
pub struct VexelConsole {
    console: *const ConsoleBuffer,
}

#[repr(C)]
/// ### English
/// Opaque interrupt token passed to a script engine while it executes.
///
/// ### 中文
/// 脚本引擎执行期间传入的不透明中断令牌。
pub struct VexelInterrupt {
    interrupt: *const ScriptInterrupt,
}

#[repr(C)]
#[derive(Clone, Copy)]
/// ### English
/// Host-implemented animation scene. `advance` returns non-zero while the
/// scene still needs advancing; `draw` receives the frame's native texture
/// and dimensions; `release` (optional) is called when the last reference is
/// dropped. All callbacks must tolerate being invoked from worker threads.
///
/// ### 中文
/// 由宿主实现的动画场景。`advance` 在场景仍需推进时返回非零；`draw` 接收该帧的
/// 原生纹理与尺寸；`release`（可选）在最后一个引用被释放时调用。所有回调必须
/// 容忍来自 worker 线程的调用。
pub struct VexelSceneVtable {
    pub advance: extern "C" fn(user_data: *mut c_void, elapsed: f64) -> u8,
    pub draw: extern "C" fn(user_data: *mut c_void, native_texture: u64, width: u32, height: u32),
    pub bind_data_context: extern "C" fn(user_data: *mut c_void, token: u64),
    pub unbind_data_context: extern "C" fn(user_data: *mut c_void),
    pub pointer_event: extern "C" fn(user_data: *mut c_void, kind: u32, x: f64, y: f64),
    pub release: Option<extern "C" fn(user_data: *mut c_void)>,
}

#[repr(C)]
#[derive(Clone, Copy)]
/// ### English
/// Host-implemented script engine. `execute_module` returns non-zero on
/// success; it must poll `vexel_native_interrupt_requested` from its
/// safepoints and abandon execution once it trips.
///
/// ### 中文
/// 由宿主实现的脚本引擎。`execute_module` 成功时返回非零；它必须在安全点轮询
/// `vexel_native_interrupt_requested`，并在触发后放弃执行。
pub struct VexelScriptVtable {
    pub execute_module: extern "C" fn(
        user_data: *mut c_void,
        source: *const c_char,
        console: *mut VexelConsole,
        interrupt: *const VexelInterrupt,
    ) -> u8,
    pub release: Option<extern "C" fn(user_data: *mut c_void)>,
}

#[repr(C)]
#[derive(Clone, Copy)]
/// ### English
/// Host-implemented layout engine.
///
/// ### 中文
/// 由宿主实现的布局引擎。
pub struct VexelLayoutVtable {
    pub compute_layout: extern "C" fn(
        user_data: *mut c_void,
        node: u64,
        constraints: LayoutConstraints,
        out_layout: *mut ComputedLayout,
    ),
    pub set_measure_function: extern "C" fn(
        user_data: *mut c_void,
        node: u64,
        callback: Option<MeasureCallback>,
        callback_user_data: *mut c_void,
    ),
    pub mark_dirty: extern "C" fn(user_data: *mut c_void, node: u64),
    pub release: Option<extern "C" fn(user_data: *mut c_void)>,
}

struct FfiScene {
    vtable: VexelSceneVtable,
    user_data: *mut c_void,
}

// The vtable contract requires host callbacks to be callable from worker
// threads; the token is only ever handed back to those callbacks.
unsafe impl Send for FfiScene {}

impl SceneRuntime for FfiScene {
    fn advance(&mut self, elapsed: f64) -> bool {
        (self.vtable.advance)(self.user_data, elapsed) != 0
    }

    fn draw(&mut self, renderer: &mut dyn SceneRenderer) {
        let size = renderer.size();
        (self.vtable.draw)(
            self.user_data,
            renderer.native_texture(),
            size.width,
            size.height,
        );
    }

    fn bind_data_context(&mut self, token: u64) {
        (self.vtable.bind_data_context)(self.user_data, token);
    }

    fn unbind_data_context(&mut self) {
        (self.vtable.unbind_data_context)(self.user_data);
    }

    fn pointer_event(&mut self, event: PointerEvent) {
        let kind = match event.kind {
            PointerKind::Down => VEXEL_NATIVE_POINTER_DOWN,
            PointerKind::Up => VEXEL_NATIVE_POINTER_UP,
            PointerKind::Move => VEXEL_NATIVE_POINTER_MOVE,
            PointerKind::Exit => VEXEL_NATIVE_POINTER_EXIT,
        };
        (self.vtable.pointer_event)(self.user_data, kind, event.position.x, event.position.y);
    }
}

impl Drop for FfiScene {
    fn drop(&mut self) {
        if let Some(release) = self.vtable.release {
            release(self.user_data);
        }
    }
}

struct FfiScriptEngine {
    vtable: VexelScriptVtable,
    user_data: *mut c_void,
}

unsafe impl Send for FfiScriptEngine {}

impl ScriptEngine for FfiScriptEngine {
    fn execute_module(
        &mut self,
        source: &str,
        console: &ConsoleBuffer,
        interrupt: &ScriptInterrupt,
    ) -> Result<(), EngineError> {
        let Ok(source) = std::ffi::CString::new(source) else {
            return Err(EngineError::Device("script source contains NUL".into()));
        };
        let mut console_view = VexelConsole {
            console: console as *const ConsoleBuffer,
        };
        let interrupt_view = VexelInterrupt {
            interrupt: interrupt as *const ScriptInterrupt,
        };
        let ok = (self.vtable.execute_module)(
            self.user_data,
            source.as_ptr(),
            &mut console_view,
            &interrupt_view,
        );
        if ok != 0 {
            Ok(())
        } else {
            Err(EngineError::Device("script module execution failed".into()))
        }
    }
}

impl Drop for FfiScriptEngine {
    fn drop(&mut self) {
        if let Some(release) = self.vtable.release {
            release(self.user_data);
        }
    }
}

struct FfiLayoutEngine {
    vtable: VexelLayoutVtable,
    user_data: *mut c_void,
}

unsafe impl Send for FfiLayoutEngine {}

impl LayoutEngine for FfiLayoutEngine {
    fn compute_layout(&mut self, node: u64, constraints: LayoutConstraints) -> ComputedLayout {
        let mut out = ComputedLayout::default();
        (self.vtable.compute_layout)(self.user_data, node, constraints, &mut out);
        out
    }

    fn set_measure_function(
        &mut self,
        node: u64,
        callback: Option<MeasureCallback>,
        user_data: *mut c_void,
    ) {
        (self.vtable.set_measure_function)(self.user_data, node, callback, user_data);
    }

    fn mark_dirty(&mut self, node: u64) {
        (self.vtable.mark_dirty)(self.user_data, node);
    }
}

impl Drop for FfiLayoutEngine {
    fn drop(&mut self) {
        if let Some(release) = self.vtable.release {
            release(self.user_data);
        }
    }
}

fn pointer_kind_from(kind: u32) -> Option<PointerKind> {
    match kind {
        VEXEL_NATIVE_POINTER_DOWN => Some(PointerKind::Down),
        VEXEL_NATIVE_POINTER_UP => Some(PointerKind::Up),
        VEXEL_NATIVE_POINTER_MOVE => Some(PointerKind::Move),
        VEXEL_NATIVE_POINTER_EXIT => Some(PointerKind::Exit),
        _ => None,
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Returns the C ABI version.
///
/// ### 中文
/// 返回 C ABI 版本号。
pub extern "C" fn vexel_native_abi_version() -> u32 {
    VEXEL_NATIVE_ABI_VERSION
}

#[unsafe(no_mangle)]
/// ### English
/// Returns `VEXEL_NATIVE_POINTER_DOWN`. (Panama/FFI-friendly constant getter.)
///
/// ### 中文
/// 返回 `VEXEL_NATIVE_POINTER_DOWN`。（FFI 友好的常量获取函数。）
pub extern "C" fn vexel_native_pointer_down() -> u32 {
    VEXEL_NATIVE_POINTER_DOWN
}

#[unsafe(no_mangle)]
/// ### English
/// Returns `VEXEL_NATIVE_POINTER_UP`.
///
/// ### 中文
/// 返回 `VEXEL_NATIVE_POINTER_UP`。
pub extern "C" fn vexel_native_pointer_up() -> u32 {
    VEXEL_NATIVE_POINTER_UP
}

#[unsafe(no_mangle)]
/// ### English
/// Returns `VEXEL_NATIVE_POINTER_MOVE`.
///
/// ### 中文
/// 返回 `VEXEL_NATIVE_POINTER_MOVE`。
pub extern "C" fn vexel_native_pointer_move() -> u32 {
    VEXEL_NATIVE_POINTER_MOVE
}

#[unsafe(no_mangle)]
/// ### English
/// Returns `VEXEL_NATIVE_POINTER_EXIT`.
///
/// ### 中文
/// 返回 `VEXEL_NATIVE_POINTER_EXIT`。
pub extern "C" fn vexel_native_pointer_exit() -> u32 {
    VEXEL_NATIVE_POINTER_EXIT
}

#[unsafe(no_mangle)]
/// ### English
/// Creates a renderer context over the host's OpenGL context. `loader`
/// resolves GL proc names; `make_current` (optional) makes the host context
/// current on the calling thread. `is_intel` disables shared-texture export
/// on affected integrated parts.
///
/// ### 中文
/// 基于宿主的 OpenGL 上下文创建渲染器上下文。`loader` 解析 GL 函数名；
/// `make_current`（可选）使宿主上下文在调用线程上变为 current。`is_intel`
/// 在受影响的集成显卡上禁用共享纹理导出。
pub extern "C" fn vexel_native_create_context_gl(
    loader: Option<GlProcLoader>,
    make_current: Option<MakeCurrentCallback>,
    user_data: *mut c_void,
    is_intel: u8,
) -> *mut VexelRendererContext {
    let Some(loader) = loader else {
        return std::ptr::null_mut();
    };

    let Ok(device) = GlDevice::new(loader, make_current, user_data) else {
        return std::ptr::null_mut();
    };
    let context = RendererContext::new(
        Arc::new(device),
        VendorHints {
            is_intel: is_intel != 0,
        },
    );
    Box::into_raw(Box::new(VexelRendererContext { context }))
}

#[unsafe(no_mangle)]
/// ### English
/// Destroys a renderer context. All render targets created from it must be
/// destroyed first.
///
/// ### 中文
/// 销毁渲染器上下文。由它创建的所有渲染目标必须先行销毁。
pub unsafe extern "C" fn vexel_native_destroy_context(context: *mut VexelRendererContext) {
    if context.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(context));
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Creates a render target. `on_frame_available` fires exactly once per
/// submitted frame, with `user_data`, once the frame's pixels are published.
///
/// ### 中文
/// 创建渲染目标。`on_frame_available` 在每个已提交帧的像素发布后携带
/// `user_data` 恰好触发一次。
pub unsafe extern "C" fn vexel_native_create_render_target(
    context: *mut VexelRendererContext,
    width: u32,
    height: u32,
    on_frame_available: Option<FrameAvailableCallback>,
    user_data: *mut c_void,
) -> *mut VexelRenderTarget {
    if context.is_null() || width == 0 || height == 0 {
        return std::ptr::null_mut();
    }

    let observer = FrameObserver::new(on_frame_available, user_data);
    let size = PhysicalSize::new(width, height);
    let target = unsafe { (*context).context.create_target(size, observer) };
    let Ok(target) = target else {
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(VexelRenderTarget { target }))
}

#[unsafe(no_mangle)]
/// ### English
/// Destroys a render target: drains the in-flight frame, joins the
/// presentation worker, then releases GPU resources, in that order.
///
/// ### 中文
/// 销毁渲染目标：先排空在途帧并 join 呈现 worker，再释放 GPU 资源。
pub unsafe extern "C" fn vexel_native_destroy_render_target(target: *mut VexelRenderTarget) {
    if target.is_null() {
        return;
    }
    unsafe {
        (*target).target.shutdown();
        drop(Box::from_raw(target));
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Begins a frame. Blocks while the previous frame is in flight. `clear`
/// non-zero clears the slot to `clear_color` (ARGB). Returns NULL during
/// teardown; the returned renderer must be passed to `end_frame`.
///
/// ### 中文
/// 开始一帧。上一帧在途时阻塞。`clear` 非零时将槽位清为 `clear_color`
/// （ARGB）。销毁期间返回 NULL；返回的 renderer 必须交给 `end_frame`。
pub unsafe extern "C" fn vexel_native_begin_frame(
    target: *mut VexelRenderTarget,
    clear: u8,
    clear_color: u32,
) -> *mut VexelFrameRenderer {
    if target.is_null() {
        return std::ptr::null_mut();
    }

    let load_action = if clear != 0 {
        LoadAction::Clear(clear_color)
    } else {
        LoadAction::Preserve
    };
    match unsafe { (*target).target.begin_frame(load_action) } {
        Ok(frame) => Box::into_raw(Box::new(VexelFrameRenderer { frame })),
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Ends a frame: submits the GPU work, attaches the completion signal, and
/// hands the frame to the presentation pipeline. Consumes `renderer`.
///
/// ### 中文
/// 结束一帧：提交 GPU 工作、附加完成 signal，并把该帧交给呈现管线。
/// 会消费 `renderer`。
pub unsafe extern "C" fn vexel_native_end_frame(
    target: *mut VexelRenderTarget,
    renderer: *mut VexelFrameRenderer,
) -> bool {
    if target.is_null() || renderer.is_null() {
        return false;
    }

    let frame = unsafe { Box::from_raw(renderer) }.frame;
    unsafe { (*target).target.end_frame(frame).is_ok() }
}

#[unsafe(no_mangle)]
/// ### English
/// Native texture handle of the frame being rendered (GL texture name).
///
/// ### 中文
/// 正在渲染帧的原生纹理句柄（GL 纹理名）。
pub unsafe extern "C" fn vexel_native_frame_texture(renderer: *const VexelFrameRenderer) -> u64 {
    if renderer.is_null() {
        return 0;
    }
    unsafe { (*renderer).frame.native_texture() }
}

#[unsafe(no_mangle)]
/// ### English
/// Pointer to the target's BGRA pixel buffer, with its dimensions. NULL if
/// the target uses the shared-texture strategy. The pointer stays valid for
/// the target's lifetime; the contents are stable only between two
/// `on_frame_available` callbacks.
///
/// ### 中文
/// 指向目标 BGRA 像素缓冲区的指针及其尺寸。目标使用共享纹理策略时为 NULL。
/// 指针在目标生命周期内有效；内容仅在两次 `on_frame_available` 回调之间稳定。
pub unsafe extern "C" fn vexel_native_get_pixel_buffer(
    target: *const VexelRenderTarget,
    out_width: *mut u32,
    out_height: *mut u32,
) -> *const u8 {
    if target.is_null() {
        return std::ptr::null();
    }

    let Some(buffer) = (unsafe { &(*target).target }).pixel_buffer() else {
        return std::ptr::null();
    };
    let size = buffer.size();
    if !out_width.is_null() {
        unsafe { *out_width = size.width };
    }
    if !out_height.is_null() {
        unsafe { *out_height = size.height };
    }
    buffer.as_ptr()
}

#[unsafe(no_mangle)]
/// ### English
/// Latest exported shared-texture handle, or 0 if the target uses CPU
/// readback (or no frame has been published yet).
///
/// ### 中文
/// 最近导出的共享纹理句柄；目标使用 CPU 回读（或尚无已发布帧）时为 0。
pub unsafe extern "C" fn vexel_native_get_shared_texture(
    target: *const VexelRenderTarget,
    out_width: *mut u32,
    out_height: *mut u32,
) -> u64 {
    if target.is_null() {
        return 0;
    }

    let Some((handle, size)) = (unsafe { &(*target).target }).shared_texture() else {
        return 0;
    };
    if !out_width.is_null() {
        unsafe { *out_width = size.width };
    }
    if !out_height.is_null() {
        unsafe { *out_height = size.height };
    }
    handle
}

#[unsafe(no_mangle)]
/// ### English
/// Registers a host scene and returns its handle (reference count 1).
/// Returns 0 on caller misuse.
///
/// ### 中文
/// 注册宿主场景并返回其句柄（引用计数 1）。调用方误用时返回 0。
pub unsafe extern "C" fn vexel_native_register_scene(
    context: *mut VexelRendererContext,
    vtable: *const VexelSceneVtable,
    user_data: *mut c_void,
) -> u64 {
    if context.is_null() || vtable.is_null() {
        return 0;
    }

    let scene = FfiScene {
        vtable: unsafe { *vtable },
        user_data,
    };
    unsafe { (*context).context.register_scene(Box::new(scene)) }.as_u64()
}

#[unsafe(no_mangle)]
/// ### English
/// Increments a scene's reference count. Returns false for stale handles.
///
/// ### 中文
/// 递增场景引用计数。句柄过期时返回 false。
pub unsafe extern "C" fn vexel_native_retain_scene(
    context: *mut VexelRendererContext,
    handle: u64,
) -> bool {
    if context.is_null() {
        return false;
    }
    unsafe { (*context).context.retain_scene(RawHandle::from_u64(handle)) }
}

#[unsafe(no_mangle)]
/// ### English
/// Decrements a scene's reference count, destroying it at zero. Returns true
/// when this call destroyed the scene.
///
/// ### 中文
/// 递减场景引用计数，归零时销毁。本次调用销毁了场景时返回 true。
pub unsafe extern "C" fn vexel_native_release_scene(
    context: *mut VexelRendererContext,
    handle: u64,
) -> bool {
    if context.is_null() {
        return false;
    }
    unsafe { (*context).context.release_scene(RawHandle::from_u64(handle)) }
}

#[unsafe(no_mangle)]
/// ### English
/// Forwards a pointer event to a scene. `kind` is one of the
/// `vexel_native_pointer_*` constants; coordinates are in target pixels.
///
/// ### 中文
/// 向场景转发指针事件。`kind` 为 `vexel_native_pointer_*` 常量之一；
/// 坐标为目标像素。
pub unsafe extern "C" fn vexel_native_pointer_event(
    context: *mut VexelRendererContext,
    handle: u64,
    kind: u32,
    x: f64,
    y: f64,
) -> bool {
    if context.is_null() {
        return false;
    }
    let Some(kind) = pointer_kind_from(kind) else {
        return false;
    };

    let event = PointerEvent {
        kind,
        position: PhysicalPosition::new(x, y),
    };
    unsafe {
        (*context)
            .context
            .pointer_event(RawHandle::from_u64(handle), event)
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Binds the host data context identified by `token` to a scene.
///
/// ### 中文
/// 将 `token` 标识的宿主数据上下文绑定到场景。
pub unsafe extern "C" fn vexel_native_bind_data_context(
    context: *mut VexelRendererContext,
    handle: u64,
    token: u64,
) -> bool {
    if context.is_null() {
        return false;
    }
    unsafe {
        (*context)
            .context
            .bind_data_context(RawHandle::from_u64(handle), token)
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Unbinds a scene's data context.
///
/// ### 中文
/// 解绑场景的数据上下文。
pub unsafe extern "C" fn vexel_native_unbind_data_context(
    context: *mut VexelRendererContext,
    handle: u64,
) -> bool {
    if context.is_null() {
        return false;
    }
    unsafe {
        (*context)
            .context
            .unbind_data_context(RawHandle::from_u64(handle))
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Advances `count` scenes by `elapsed` seconds across the worker pool.
/// `out_needs_more` (optional, `count` bytes) receives non-zero per scene
/// that still needs advancing. Returns how many scenes still need advancing.
///
/// ### 中文
/// 在 worker 池上把 `count` 个场景推进 `elapsed` 秒。`out_needs_more`
/// （可选，`count` 字节）按场景写入是否仍需推进的非零值。返回仍需推进的场景数。
pub unsafe extern "C" fn vexel_native_batch_advance(
    context: *mut VexelRendererContext,
    handles: *const u64,
    count: u32,
    elapsed: f64,
    out_needs_more: *mut u8,
) -> u32 {
    if context.is_null() || handles.is_null() {
        return 0;
    }

    let raw_handles = unsafe { std::slice::from_raw_parts(handles, count as usize) };
    let handles: Vec<RawHandle> = raw_handles.iter().map(|&h| RawHandle::from_u64(h)).collect();
    let results = unsafe { (*context).context.batch_advance(&handles, elapsed) };

    if !out_needs_more.is_null() {
        let out = unsafe { std::slice::from_raw_parts_mut(out_needs_more, count as usize) };
        for (slot, needs_more) in out.iter_mut().zip(&results) {
            *slot = *needs_more as u8;
        }
    }
    results.iter().filter(|&&n| n).count() as u32
}

#[unsafe(no_mangle)]
/// ### English
/// Advances `count` scenes on the worker pool and draws each into the frame
/// in submission order, starting each draw as soon as its advance completes.
///
/// ### 中文
/// 在 worker 池上推进 `count` 个场景，并按提交顺序把每个场景绘制到帧里；
/// 每个场景的推进一完成就开始它的绘制。
pub unsafe extern "C" fn vexel_native_batch_advance_and_render(
    context: *mut VexelRendererContext,
    handles: *const u64,
    count: u32,
    elapsed: f64,
    renderer: *mut VexelFrameRenderer,
) -> bool {
    if context.is_null() || handles.is_null() || renderer.is_null() {
        return false;
    }

    let raw_handles = unsafe { std::slice::from_raw_parts(handles, count as usize) };
    let handles: Vec<RawHandle> = raw_handles.iter().map(|&h| RawHandle::from_u64(h)).collect();
    unsafe {
        (*context)
            .context
            .batch_advance_and_render(&handles, elapsed, &mut (*renderer).frame);
    }
    true
}

#[unsafe(no_mangle)]
/// ### English
/// Registers the host script engine for this context, replacing any previous
/// one.
///
/// ### 中文
/// 为该上下文注册宿主脚本引擎，替换之前的引擎。
pub unsafe extern "C" fn vexel_native_set_script_engine(
    context: *mut VexelRendererContext,
    vtable: *const VexelScriptVtable,
    user_data: *mut c_void,
) -> bool {
    if context.is_null() || vtable.is_null() {
        return false;
    }

    let engine = FfiScriptEngine {
        vtable: unsafe { *vtable },
        user_data,
    };
    unsafe { (*context).context.set_script_engine(Box::new(engine)) };
    true
}

#[unsafe(no_mangle)]
/// ### English
/// Executes one script module under the execution budget. Returns false if
/// no engine is registered, the source is not valid UTF-8, or execution
/// failed.
///
/// ### 中文
/// 在执行预算内执行一个脚本模块。未注册引擎、源码非法 UTF-8 或执行失败时
/// 返回 false。
pub unsafe extern "C" fn vexel_native_execute_script_module(
    context: *mut VexelRendererContext,
    source: *const c_char,
) -> bool {
    if context.is_null() || source.is_null() {
        return false;
    }

    let Ok(source) = (unsafe { CStr::from_ptr(source) }).to_str() else {
        return false;
    };
    unsafe { (*context).context.execute_script_module(source).is_ok() }
}

#[unsafe(no_mangle)]
/// ### English
/// Number of console bytes currently buffered.
///
/// ### 中文
/// 当前已缓冲的控制台字节数。
pub unsafe extern "C" fn vexel_native_console_pending_bytes(
    context: *const VexelRendererContext,
) -> u32 {
    if context.is_null() {
        return 0;
    }
    (unsafe { &(*context).context })
        .with_console(|console| console.byte_len() as u32)
        .unwrap_or(0)
}

#[unsafe(no_mangle)]
/// ### English
/// Drains buffered console records into `out` (up to `capacity` bytes) and
/// re-arms the has-data callback. Returns the number of bytes written;
/// records that do not fit are dropped.
///
/// ### 中文
/// 把已缓冲的控制台记录排空到 `out`（至多 `capacity` 字节）并重新武装
/// “有数据”回调。返回写入的字节数；放不下的记录会被丢弃。
pub unsafe extern "C" fn vexel_native_console_take(
    context: *mut VexelRendererContext,
    out: *mut u8,
    capacity: u32,
) -> u32 {
    if context.is_null() || out.is_null() {
        return 0;
    }

    let bytes = (unsafe { &(*context).context })
        .with_console(|console| console.take())
        .unwrap_or_default();
    let len = bytes.len().min(capacity as usize);
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, len) };
    len as u32
}

#[unsafe(no_mangle)]
/// ### English
/// Registers the "console has data" callback; it fires at most once between
/// drains.
///
/// ### 中文
/// 注册“控制台有数据”回调；两次排空之间至多触发一次。
pub unsafe extern "C" fn vexel_native_console_set_observer(
    context: *mut VexelRendererContext,
    callback: Option<ConsoleDataCallback>,
    user_data: *mut c_void,
) -> bool {
    if context.is_null() {
        return false;
    }
    (unsafe { &(*context).context })
        .with_console(|console| console.set_observer(callback, user_data))
        .is_some()
}

#[unsafe(no_mangle)]
/// ### English
/// Begins a console output line. Only valid inside a script engine's
/// `execute_module` call.
///
/// ### 中文
/// 开始一行控制台输出。仅在脚本引擎 `execute_module` 调用内有效。
pub unsafe extern "C" fn vexel_native_console_begin_line(
    console: *mut VexelConsole,
    source: u64,
    line: u32,
) {
    if console.is_null() {
        return;
    }
    unsafe { &*(*console).console }.begin_line(source, line);
}

#[unsafe(no_mangle)]
/// ### English
/// Appends printed text to the open console line.
///
/// ### 中文
/// 向当前控制台行追加打印文本。
pub unsafe extern "C" fn vexel_native_console_print(console: *mut VexelConsole, text: *const c_char) {
    if console.is_null() || text.is_null() {
        return;
    }
    if let Ok(text) = unsafe { CStr::from_ptr(text) }.to_str() {
        unsafe { &*(*console).console }.push_text(text);
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Ends the open console line.
///
/// ### 中文
/// 结束当前控制台行。
pub unsafe extern "C" fn vexel_native_console_end_line(console: *mut VexelConsole) {
    if console.is_null() {
        return;
    }
    unsafe { &*(*console).console }.end_line();
}

#[unsafe(no_mangle)]
/// ### English
/// Records a parsed script error.
///
/// ### 中文
/// 记录一条已解析的脚本错误。
pub unsafe extern "C" fn vexel_native_console_error(
    console: *mut VexelConsole,
    file: *const c_char,
    line: u32,
    message: *const c_char,
) {
    if console.is_null() || file.is_null() || message.is_null() {
        return;
    }
    let (Ok(file), Ok(message)) = (
        unsafe { CStr::from_ptr(file) }.to_str(),
        unsafe { CStr::from_ptr(message) }.to_str(),
    ) else {
        return;
    };
    unsafe { &*(*console).console }.push_error(file, line, message);
}

#[unsafe(no_mangle)]
/// ### English
/// Whether the execution budget has elapsed; engines poll this from their
/// safepoints.
///
/// ### 中文
/// 执行预算是否已耗尽；引擎在安全点轮询此函数。
pub unsafe extern "C" fn vexel_native_interrupt_requested(
    interrupt: *const VexelInterrupt,
) -> bool {
    if interrupt.is_null() {
        return true;
    }
    unsafe { &*(*interrupt).interrupt }.should_interrupt()
}

#[unsafe(no_mangle)]
/// ### English
/// Registers the host layout engine plus its dirty-notification callback.
///
/// ### 中文
/// 注册宿主布局引擎及其脏标记通知回调。
pub unsafe extern "C" fn vexel_native_set_layout_engine(
    context: *mut VexelRendererContext,
    vtable: *const VexelLayoutVtable,
    user_data: *mut c_void,
    on_dirty: Option<LayoutDirtyCallback>,
    dirty_user_data: *mut c_void,
) -> bool {
    if context.is_null() || vtable.is_null() {
        return false;
    }

    let engine = FfiLayoutEngine {
        vtable: unsafe { *vtable },
        user_data,
    };
    let observer = LayoutObserver::new(on_dirty, dirty_user_data);
    unsafe {
        (*context)
            .context
            .set_layout_engine(Box::new(engine), observer)
    };
    true
}

#[unsafe(no_mangle)]
/// ### English
/// Computes layout for `node` under `constraints`.
///
/// ### 中文
/// 在 `constraints` 约束下计算 `node` 的布局。
pub unsafe extern "C" fn vexel_native_compute_layout(
    context: *mut VexelRendererContext,
    node: u64,
    constraints: LayoutConstraints,
    out_layout: *mut ComputedLayout,
) -> bool {
    if context.is_null() || out_layout.is_null() {
        return false;
    }

    match unsafe { (*context).context.compute_layout(node, constraints) } {
        Some(layout) => {
            unsafe { *out_layout = layout };
            true
        }
        None => false,
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Registers a measure function for leaf content under `node`.
///
/// ### 中文
/// 为 `node` 下的叶子内容注册测量函数。
pub unsafe extern "C" fn vexel_native_set_measure_function(
    context: *mut VexelRendererContext,
    node: u64,
    callback: Option<MeasureCallback>,
    user_data: *mut c_void,
) -> bool {
    if context.is_null() {
        return false;
    }
    unsafe {
        (*context)
            .context
            .set_measure_function(node, callback, user_data)
    }
}

#[unsafe(no_mangle)]
/// ### English
/// Marks `node` dirty in the layout engine and notifies the host callback.
///
/// ### 中文
/// 在布局引擎中把 `node` 标脏，并通知宿主回调。
pub unsafe extern "C" fn vexel_native_mark_layout_dirty(
    context: *mut VexelRendererContext,
    node: u64,
) -> bool {
    if context.is_null() {
        return false;
    }
    unsafe { (*context).context.mark_layout_dirty(node) }
}
