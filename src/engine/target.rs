//! ### English
//! Render-target context.
//!
//! Ties the swapchain, the fence tracker, the publish strategy, and the
//! presentation coordinator together behind the begin/end frame contract the
//! host drives. `begin_frame` applies backpressure (at most one frame in
//! flight) and rotates to the next slot; `end_frame` submits, attaches a
//! completion signal, and hands the frame to the coordinator.
//!
//! ### 中文
//! 渲染目标上下文。
//!
//! 把交换链、fence 跟踪器、发布策略与呈现协调器整合在宿主驱动的 begin/end
//! frame 契约之后。`begin_frame` 施加背压（至多一帧在途）并轮转到下一个槽位；
//! `end_frame` 提交、附加完成 signal，并把该帧交给协调器。

use std::sync::Arc;

use dpi::PhysicalSize;

use crate::engine::error::EngineError;
use crate::engine::fence::FrameFenceTracker;
use crate::engine::gpu::Device;
use crate::engine::present::{
    FrameObserver, FramePublisher, PresentationCoordinator, SharedTextureOutput,
    SharedTexturePublisher,
};
use crate::engine::readback::{PixelBuffer, ReadbackPublisher};
use crate::engine::scene::SceneRenderer;
use crate::engine::swapchain::{RenderSlot, Swapchain};

/// ### English
/// How the frame's slot texture is initialized at `begin_frame`.
///
/// ### 中文
/// `begin_frame` 时该帧槽位纹理的初始化方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadAction {
    /// Clear to the given ARGB color before the runtime draws.
    Clear(u32),
    /// Keep whatever the slot held from its previous lap.
    Preserve,
}

/// ### English
/// Publish strategy selected for a target at construction.
///
/// ### 中文
/// 目标构造时选定的发布策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishStrategy {
    Readback,
    SharedTexture,
}

/// ### English
/// One in-progress frame. Handed to the animation runtime as its draw sink;
/// consumed by [`RenderTarget::end_frame`].
///
/// ### 中文
/// 一个进行中的帧。作为绘制汇交给动画运行时；由 [`RenderTarget::end_frame`] 消费。
pub struct FrameRenderer {
    slot: RenderSlot,
    load_action: LoadAction,
}

impl FrameRenderer {
    pub fn load_action(&self) -> LoadAction {
        self.load_action
    }

    pub fn slot_index(&self) -> usize {
        self.slot.index
    }
}

impl SceneRenderer for FrameRenderer {
    fn size(&self) -> PhysicalSize<u32> {
        self.slot.texture.size()
    }

    fn native_texture(&self) -> u64 {
        self.slot.texture.native_handle()
    }
}

/// ### English
/// A host-visible render surface: fixed-size slot ring plus the completion
/// and publish machinery for it.
///
/// Field order is load-bearing: the coordinator must drop (joining its
/// worker) before the swapchain releases GPU textures.
///
/// ### 中文
/// 宿主可见的渲染表面：固定大小的槽位环，加上配套的完成与发布机制。
///
/// 字段顺序有实际意义：协调器必须先析构（join 其 worker），交换链才能释放
/// GPU 纹理。
pub struct RenderTarget {
    coordinator: PresentationCoordinator,
    swapchain: Arc<Swapchain>,
    device: Arc<dyn Device>,
    tracker: Arc<FrameFenceTracker>,
    strategy: PublishStrategy,
    pixel_buffer: Option<Arc<PixelBuffer>>,
    shared_output: Option<Arc<SharedTextureOutput>>,
    size: PhysicalSize<u32>,
}

impl RenderTarget {
    pub fn new(
        device: Arc<dyn Device>,
        size: PhysicalSize<u32>,
        observer: FrameObserver,
        strategy: PublishStrategy,
    ) -> Result<Self, EngineError> {
        let swapchain = Arc::new(Swapchain::new(device.as_ref(), size)?);
        let tracker = Arc::new(FrameFenceTracker::new(device.as_ref())?);

        let mut pixel_buffer = None;
        let mut shared_output = None;
        let publisher: Box<dyn FramePublisher> = match strategy {
            PublishStrategy::Readback => {
                let buffer = Arc::new(PixelBuffer::new(size));
                pixel_buffer = Some(buffer.clone());
                Box::new(ReadbackPublisher::new(device.clone(), buffer))
            }
            PublishStrategy::SharedTexture => {
                let output = Arc::new(SharedTextureOutput::default());
                shared_output = Some(output.clone());
                Box::new(SharedTexturePublisher::new(output))
            }
        };

        let coordinator =
            PresentationCoordinator::new(swapchain.clone(), tracker.clone(), publisher, observer);

        Ok(Self {
            coordinator,
            swapchain,
            device,
            tracker,
            strategy,
            pixel_buffer,
            shared_output,
            size,
        })
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    pub fn strategy(&self) -> PublishStrategy {
        self.strategy
    }

    /// ### English
    /// Starts a frame. Blocks while the previous frame is still in flight
    /// (the render loop's only wait), then rotates to the next slot. Fails
    /// only during teardown.
    ///
    /// ### 中文
    /// 开始一帧。上一帧仍在途时阻塞——渲染循环唯一的等待点——然后轮转到下一个
    /// 槽位。只在销毁期间失败。
    pub fn begin_frame(&mut self, load_action: LoadAction) -> Result<FrameRenderer, EngineError> {
        self.coordinator.wait_idle()?;
        let slot = self.swapchain.acquire_render_target();
        if let LoadAction::Clear(argb) = load_action {
            // A failed clear degrades to Preserve; the frame still renders.
            if let Err(err) = self
                .device
                .clear_render_texture(slot.texture.as_ref(), argb)
            {
                log::warn!("slot clear failed: {err}");
            }
        }
        Ok(FrameRenderer { slot, load_action })
    }

    /// ### English
    /// Finishes a frame: marks the slot finished, signals frame completion
    /// on the GPU timeline, and submits the frame index to the coordinator.
    /// In fallback mode this call also performs the wait and publish.
    ///
    /// ### 中文
    /// 结束一帧：标记槽位完成、在 GPU 时间线上 signal 帧完成，并把帧序号提交给
    /// 协调器。回退模式下本调用同时执行等待与发布。
    pub fn end_frame(&mut self, frame: FrameRenderer) -> Result<(), EngineError> {
        self.swapchain.finish_render(frame.slot.index);
        let index = self.tracker.signal_after_submit(self.device.as_ref())?;
        self.coordinator.submit_frame(index, frame.slot.index)
    }

    /// Pixel buffer, present only under the readback strategy.
    pub fn pixel_buffer(&self) -> Option<&Arc<PixelBuffer>> {
        self.pixel_buffer.as_ref()
    }

    /// Latest shared-texture export, present only under that strategy.
    pub fn shared_texture(&self) -> Option<(u64, PhysicalSize<u32>)> {
        self.shared_output.as_ref().map(|output| output.latest())
    }

    /// ### English
    /// Explicit teardown: drains the in-flight frame and joins the worker.
    /// Also runs on drop; exposed so the boundary can order it before
    /// releasing host GPU objects.
    ///
    /// ### 中文
    /// 显式销毁：排空在途帧并 join worker。drop 时同样执行；单独暴露是为了让
    /// 边界在释放宿主 GPU 对象之前先完成它。
    pub fn shutdown(&mut self) {
        self.coordinator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gpu::testing::{MockDevice, observer_for};
    use std::sync::atomic::Ordering;

    #[test]
    fn full_frame_cycle_publishes_pixels_and_notifies_once() {
        let device = MockDevice::without_fences();
        let size = PhysicalSize::new(4, 4);
        let (observer, fired) = observer_for();
        let mut target = RenderTarget::new(
            Arc::new(device.clone()),
            size,
            observer,
            PublishStrategy::Readback,
        )
        .unwrap();

        device.resolve_query_after_polls(0);
        let frame = target.begin_frame(LoadAction::Clear(0xFF00_0000)).unwrap();
        device.fill_texture_by_handle(frame.native_texture(), 0x7A);
        target.end_frame(frame).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(device.clear_count(), 1);
        target
            .pixel_buffer()
            .unwrap()
            .with_pixels(|pixels| assert!(pixels.iter().all(|&b| b == 0x7A)));
    }

    #[test]
    fn shared_strategy_exports_the_presented_slot_handle() {
        let device = MockDevice::without_fences();
        device.enable_shared_textures();
        let size = PhysicalSize::new(4, 4);
        let (observer, _fired) = observer_for();
        let mut target = RenderTarget::new(
            Arc::new(device.clone()),
            size,
            observer,
            PublishStrategy::SharedTexture,
        )
        .unwrap();

        device.resolve_query_after_polls(0);
        let frame = target.begin_frame(LoadAction::Preserve).unwrap();
        let expected_handle = frame.native_texture();
        target.end_frame(frame).unwrap();

        let (handle, exported_size) = target.shared_texture().unwrap();
        assert_eq!(handle, expected_handle);
        assert_eq!(exported_size, size);
        assert!(target.pixel_buffer().is_none());
    }

    #[test]
    fn begin_frame_fails_after_shutdown() {
        let device = MockDevice::with_fences();
        let (observer, _fired) = observer_for();
        let mut target = RenderTarget::new(
            Arc::new(device),
            PhysicalSize::new(4, 4),
            observer,
            PublishStrategy::Readback,
        )
        .unwrap();

        target.shutdown();
        assert!(matches!(
            target.begin_frame(LoadAction::Preserve),
            Err(EngineError::Terminated)
        ));
    }
}
