//! ### English
//! Renderer context.
//!
//! The root object the host creates once per GPU device: runs the capability
//! probes, carries vendor hints, owns the scene handle table and the advance
//! worker pool, hosts the optional script and layout collaborators, and
//! constructs render targets with the publish strategy the probe selected.
//!
//! ### 中文
//! 渲染器上下文。
//!
//! 宿主为每个 GPU 设备创建一次的根对象：执行能力探测、携带厂商提示、持有场景
//! 句柄表与推进 worker 池、承载可选的脚本与布局协作者，并用探测选定的发布策略
//! 构造渲染目标。

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dpi::PhysicalSize;

use crate::engine::error::EngineError;
use crate::engine::gpu::Device;
use crate::engine::handles::{HandleTable, RawHandle};
use crate::engine::layout::{
    ComputedLayout, LayoutConstraints, LayoutEngine, LayoutObserver, MeasureCallback,
};
use crate::engine::present::FrameObserver;
use crate::engine::scene::{PointerEvent, SceneRenderer, SceneRuntime};
use crate::engine::script::{ConsoleBuffer, ScriptEngine, ScriptHost};
use crate::engine::target::{PublishStrategy, RenderTarget};
use crate::engine::workers::AdvancePool;

type SceneBox = Box<dyn SceneRuntime>;

struct LayoutHost {
    engine: Box<dyn LayoutEngine>,
    observer: LayoutObserver,
}

/// ### English
/// Vendor quirks reported by the host at context creation.
///
/// ### 中文
/// 宿主在创建上下文时报告的厂商特性。
#[derive(Clone, Copy, Debug, Default)]
pub struct VendorHints {
    /// Intel integrated parts mishandle cross-API shared surfaces; the
    /// context falls back to CPU readback for them.
    pub is_intel: bool,
}

/// ### English
/// Root engine object for one host GPU device.
///
/// ### 中文
/// 对应单个宿主 GPU 设备的引擎根对象。
pub struct RendererContext {
    device: Arc<dyn Device>,
    hints: VendorHints,
    /// Shared-texture capability, probed once at construction.
    shared_textures: bool,
    scenes: Arc<HandleTable<SceneBox>>,
    pool: AdvancePool,
    script: Mutex<Option<ScriptHost>>,
    layout: Mutex<Option<LayoutHost>>,
}

impl RendererContext {
    pub fn new(device: Arc<dyn Device>, hints: VendorHints) -> Self {
        let shared_textures = device.supports_shared_textures();
        if shared_textures && hints.is_intel {
            log::debug!("shared-texture export disabled by vendor hint");
        }
        Self {
            device,
            hints,
            shared_textures,
            scenes: Arc::new(HandleTable::new()),
            pool: AdvancePool::with_default_workers(),
            script: Mutex::new(None),
            layout: Mutex::new(None),
        }
    }

    /// Publish strategy targets created by this context will use.
    pub fn publish_strategy(&self) -> PublishStrategy {
        if self.shared_textures && !self.hints.is_intel {
            PublishStrategy::SharedTexture
        } else {
            PublishStrategy::Readback
        }
    }

    pub fn create_target(
        &self,
        size: PhysicalSize<u32>,
        observer: FrameObserver,
    ) -> Result<RenderTarget, EngineError> {
        RenderTarget::new(self.device.clone(), size, observer, self.publish_strategy())
    }

    // --- scenes ---------------------------------------------------------

    pub fn register_scene(&self, scene: SceneBox) -> RawHandle {
        self.scenes.insert(scene)
    }

    pub fn retain_scene(&self, handle: RawHandle) -> bool {
        self.scenes.retain(handle)
    }

    pub fn release_scene(&self, handle: RawHandle) -> bool {
        self.scenes.release(handle).is_some()
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    pub fn pointer_event(&self, handle: RawHandle, event: PointerEvent) -> bool {
        self.scenes
            .with(handle, |scene| scene.pointer_event(event))
            .is_some()
    }

    pub fn bind_data_context(&self, handle: RawHandle, token: u64) -> bool {
        self.scenes
            .with(handle, |scene| scene.bind_data_context(token))
            .is_some()
    }

    pub fn unbind_data_context(&self, handle: RawHandle) -> bool {
        self.scenes
            .with(handle, |scene| scene.unbind_data_context())
            .is_some()
    }

    /// ### English
    /// Advances every scene in `handles` by `elapsed` seconds across the
    /// worker pool. Returns, per scene in input order, whether it still needs
    /// advancing; stale handles report false.
    ///
    /// ### 中文
    /// 在 worker 池上把 `handles` 中的每个场景推进 `elapsed` 秒。按输入顺序返回
    /// 每个场景是否仍需推进；过期句柄返回 false。
    pub fn batch_advance(&self, handles: &[RawHandle], elapsed: f64) -> Vec<bool> {
        let results: Vec<Arc<AtomicBool>> = handles
            .iter()
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();

        let jobs = handles
            .iter()
            .zip(&results)
            .map(|(&handle, result)| {
                let scenes = self.scenes.clone();
                let result = result.clone();
                Box::new(move || {
                    let needs_more = scenes
                        .with(handle, |scene| scene.advance(elapsed))
                        .unwrap_or(false);
                    result.store(needs_more, Ordering::SeqCst);
                }) as Box<dyn FnOnce() + Send>
            })
            .collect();
        self.pool.run_batch(jobs);

        results.iter().map(|r| r.load(Ordering::SeqCst)).collect()
    }

    /// ### English
    /// Advances on the pool and draws each scene into `renderer` in input
    /// order, starting each draw as soon as that scene's advance completes.
    ///
    /// ### 中文
    /// 在池上推进，并按输入顺序把每个场景绘制到 `renderer`；每个场景的推进一
    /// 完成就开始它的绘制。
    pub fn batch_advance_and_render(
        &self,
        handles: &[RawHandle],
        elapsed: f64,
        renderer: &mut dyn SceneRenderer,
    ) {
        let jobs = handles
            .iter()
            .map(|&handle| {
                let scenes = self.scenes.clone();
                Box::new(move || {
                    scenes.with(handle, |scene| scene.advance(elapsed));
                }) as Box<dyn FnOnce() + Send>
            })
            .collect();
        let ticket = self.pool.submit_batch(jobs);

        for (index, &handle) in handles.iter().enumerate() {
            ticket.wait(index);
            self.scenes.with(handle, |scene| scene.draw(renderer));
        }
    }

    // --- script ---------------------------------------------------------

    pub fn set_script_engine(&self, engine: Box<dyn ScriptEngine>) {
        *self.script.lock().unwrap() = Some(ScriptHost::new(engine));
    }

    pub fn execute_script_module(&self, source: &str) -> Result<(), EngineError> {
        match self.script.lock().unwrap().as_mut() {
            Some(host) => host.execute_module(source),
            None => Err(EngineError::Device("no script engine registered".into())),
        }
    }

    /// Runs `f` over the script console, if a script engine is registered.
    pub fn with_console<R>(&self, f: impl FnOnce(&ConsoleBuffer) -> R) -> Option<R> {
        self.script.lock().unwrap().as_ref().map(|host| f(host.console()))
    }

    // --- layout ---------------------------------------------------------

    pub fn set_layout_engine(&self, engine: Box<dyn LayoutEngine>, observer: LayoutObserver) {
        *self.layout.lock().unwrap() = Some(LayoutHost { engine, observer });
    }

    pub fn compute_layout(
        &self,
        node: u64,
        constraints: LayoutConstraints,
    ) -> Option<ComputedLayout> {
        self.layout
            .lock()
            .unwrap()
            .as_mut()
            .map(|host| host.engine.compute_layout(node, constraints))
    }

    pub fn set_measure_function(
        &self,
        node: u64,
        callback: Option<MeasureCallback>,
        user_data: *mut c_void,
    ) -> bool {
        match self.layout.lock().unwrap().as_mut() {
            Some(host) => {
                host.engine.set_measure_function(node, callback, user_data);
                true
            }
            None => false,
        }
    }

    /// Marks `node` dirty in the layout engine and notifies the host.
    pub fn mark_layout_dirty(&self, node: u64) -> bool {
        match self.layout.lock().unwrap().as_mut() {
            Some(host) => {
                host.engine.mark_dirty(node);
                host.observer.notify(node);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gpu::testing::MockDevice;
    use dpi::PhysicalPosition;
    use std::sync::atomic::AtomicUsize;

    struct TestScene {
        id: u64,
        needs_more: bool,
        advanced: Arc<AtomicUsize>,
        draw_log: Arc<Mutex<Vec<u64>>>,
    }

    impl SceneRuntime for TestScene {
        fn advance(&mut self, _elapsed: f64) -> bool {
            self.advanced.fetch_add(1, Ordering::SeqCst);
            self.needs_more
        }

        fn draw(&mut self, _renderer: &mut dyn SceneRenderer) {
            self.draw_log.lock().unwrap().push(self.id);
        }

        fn bind_data_context(&mut self, _token: u64) {}

        fn unbind_data_context(&mut self) {}

        fn pointer_event(&mut self, _event: PointerEvent) {}
    }

    fn test_context() -> RendererContext {
        RendererContext::new(Arc::new(MockDevice::with_fences()), VendorHints::default())
    }

    fn scene(
        id: u64,
        needs_more: bool,
        advanced: &Arc<AtomicUsize>,
        draw_log: &Arc<Mutex<Vec<u64>>>,
    ) -> SceneBox {
        Box::new(TestScene {
            id,
            needs_more,
            advanced: advanced.clone(),
            draw_log: draw_log.clone(),
        })
    }

    #[test]
    fn batch_advance_reports_per_scene_needs_more_in_order() {
        let context = test_context();
        let advanced = Arc::new(AtomicUsize::new(0));
        let draw_log = Arc::new(Mutex::new(Vec::new()));

        let running = context.register_scene(scene(1, true, &advanced, &draw_log));
        let settled = context.register_scene(scene(2, false, &advanced, &draw_log));
        let stale = context.register_scene(scene(3, true, &advanced, &draw_log));
        context.release_scene(stale);

        let results = context.batch_advance(&[running, settled, stale], 0.016);
        assert_eq!(results, vec![true, false, false]);
        assert_eq!(advanced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_render_draws_in_submission_order() {
        let context = test_context();
        let advanced = Arc::new(AtomicUsize::new(0));
        let draw_log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<RawHandle> = (0..5)
            .map(|id| context.register_scene(scene(id, true, &advanced, &draw_log)))
            .collect();

        struct NullRenderer;
        impl SceneRenderer for NullRenderer {
            fn size(&self) -> PhysicalSize<u32> {
                PhysicalSize::new(1, 1)
            }
            fn native_texture(&self) -> u64 {
                0
            }
        }

        context.batch_advance_and_render(&handles, 0.016, &mut NullRenderer);
        assert_eq!(*draw_log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(advanced.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn vendor_hint_forces_readback_despite_capability() {
        let device = MockDevice::with_fences();
        device.enable_shared_textures();

        let capable = RendererContext::new(Arc::new(device.clone()), VendorHints::default());
        assert_eq!(capable.publish_strategy(), PublishStrategy::SharedTexture);

        let hinted = RendererContext::new(Arc::new(device), VendorHints { is_intel: true });
        assert_eq!(hinted.publish_strategy(), PublishStrategy::Readback);
    }

    #[test]
    fn pointer_events_reject_stale_handles() {
        let context = test_context();
        let advanced = Arc::new(AtomicUsize::new(0));
        let draw_log = Arc::new(Mutex::new(Vec::new()));
        let handle = context.register_scene(scene(1, false, &advanced, &draw_log));

        let event = PointerEvent {
            kind: crate::engine::scene::PointerKind::Down,
            position: PhysicalPosition::new(2.0, 3.0),
        };
        assert!(context.pointer_event(handle, event));

        context.release_scene(handle);
        assert!(!context.pointer_event(handle, event));
    }
}
