//! ### English
//! Fixed-size ring of GPU render targets.
//!
//! The renderer always advances to the next physical slot in rotation order
//! (no searching); the reader takes a scoped exclusive lease on the slot most
//! recently finished rendering. With 4 slots, at most one frame in flight,
//! and at most one slot presenting, rotation can never land on a leased slot.
//!
//! ### 中文
//! 固定大小的 GPU 渲染目标环。
//!
//! 渲染方总是按轮转顺序推进到下一个物理槽位（不做搜索）；读取方对最近完成渲染的
//! 槽位持有一个作用域内的独占租约。4 个槽位、至多一帧在途、至多一个槽位在呈现，
//! 轮转永远不会落在已租出的槽位上。

use std::sync::{Arc, Mutex, MutexGuard};

use dpi::PhysicalSize;

use crate::engine::error::EngineError;
use crate::engine::gpu::{Device, GpuTexture};

/// ### English
/// Fixed swapchain depth: render-ahead plus one frame of presentation
/// latency, with margin.
///
/// ### 中文
/// 固定的交换链深度：渲染超前量加一帧呈现延迟，并留有余量。
pub const SWAPCHAIN_SLOT_COUNT: usize = 4;

/// ### English
/// One GPU-backed render target and its presentation state.
///
/// ### 中文
/// 单个 GPU 渲染目标及其呈现状态。
struct SwapchainSlot {
    /// Texture owned exclusively by this slot while it is not presenting.
    texture: Arc<dyn GpuTexture>,
    /// Set while a readback of this slot is still outstanding.
    pending_readback: bool,
}

struct RingState {
    slots: Vec<SwapchainSlot>,
    /// Index of the slot currently being rendered into.
    render_index: usize,
    /// Index of the slot currently locked for presentation/readback, if any.
    presenting: Option<usize>,
    /// Index of the slot most recently finished rendering, if any.
    last_finished: Option<usize>,
}

/// ### English
/// Slot handed to the renderer for one frame.
///
/// ### 中文
/// 交给渲染方用于单帧的槽位。
#[derive(Clone)]
pub struct RenderSlot {
    pub index: usize,
    pub texture: Arc<dyn GpuTexture>,
}

/// ### English
/// Fixed ring of [`SWAPCHAIN_SLOT_COUNT`] render targets.
///
/// ### 中文
/// 由 [`SWAPCHAIN_SLOT_COUNT`] 个渲染目标组成的固定环。
pub struct Swapchain {
    state: Mutex<RingState>,
}

impl Swapchain {
    /// ### English
    /// Allocates the full slot pool up front. Only the first slot's texture
    /// is cleared; it is the one a compositor may sample before the first
    /// frame completes.
    ///
    /// ### 中文
    /// 预先分配全部槽位。只有第一个槽位的纹理需要清零——合成器可能在首帧完成前
    /// 就采样它。
    pub fn new(device: &dyn Device, size: PhysicalSize<u32>) -> Result<Self, EngineError> {
        let mut slots = Vec::with_capacity(SWAPCHAIN_SLOT_COUNT);
        for index in 0..SWAPCHAIN_SLOT_COUNT {
            slots.push(SwapchainSlot {
                texture: device.create_render_texture(size, index == 0)?,
                pending_readback: false,
            });
        }

        Ok(Self {
            state: Mutex::new(RingState {
                slots,
                render_index: 0,
                presenting: None,
                last_finished: None,
            }),
        })
    }

    /// ### English
    /// Returns the next slot in rotation order for rendering. Never blocks
    /// and never returns the slot locked for presentation.
    ///
    /// ### 中文
    /// 按轮转顺序返回下一个用于渲染的槽位。从不阻塞，也从不返回被呈现锁定的槽位。
    pub fn acquire_render_target(&self) -> RenderSlot {
        let mut state = self.state.lock().unwrap();

        let mut next = (state.render_index + 1) % SWAPCHAIN_SLOT_COUNT;
        if state.presenting == Some(next) {
            next = (next + 1) % SWAPCHAIN_SLOT_COUNT;
        }
        debug_assert_ne!(state.presenting, Some(next));

        state.render_index = next;
        RenderSlot {
            index: next,
            texture: state.slots[next].texture.clone(),
        }
    }

    /// ### English
    /// Records that rendering into `index` has been submitted; this slot is
    /// now the candidate for the next presentation.
    ///
    /// ### 中文
    /// 记录对 `index` 的渲染已提交；该槽位成为下一次呈现的候选。
    pub fn finish_render(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.last_finished = Some(index);
    }

    /// ### English
    /// Takes a scoped exclusive lease on `index` for one copy/present
    /// operation. The slot stays marked as presenting after the lease drops
    /// (the host may still be displaying it); only the readback marker is
    /// cleared.
    ///
    /// ### 中文
    /// 对 `index` 获取一次拷贝/呈现操作范围内的独占租约。租约释放后该槽位仍保持
    /// “呈现中”标记（宿主可能仍在显示它）；只清除回读标记。
    pub fn begin_present(&self, index: usize) -> PresentingLease<'_> {
        let mut guard = self.state.lock().unwrap();
        guard.presenting = Some(index);
        guard.slots[index].pending_readback = true;
        PresentingLease { guard, index }
    }

    /// ### English
    /// Leases the slot most recently finished rendering, if any frame has
    /// completed yet.
    ///
    /// ### 中文
    /// 租用最近完成渲染的槽位（若已有帧完成）。
    pub fn acquire_presenting_slot(&self) -> Option<PresentingLease<'_>> {
        let index = self.state.lock().unwrap().last_finished?;
        Some(self.begin_present(index))
    }
}

/// ### English
/// Scoped exclusive lease on a presenting slot. Holding the lease holds the
/// ring lock, so the underlying texture cannot be rotated back into rendering
/// while a copy/present is in progress.
///
/// ### 中文
/// 呈现槽位的作用域独占租约。持有租约即持有环锁，因此拷贝/呈现进行期间底层纹理
/// 不会被轮转回渲染用途。
pub struct PresentingLease<'a> {
    guard: MutexGuard<'a, RingState>,
    index: usize,
}

impl PresentingLease<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn texture(&self) -> &Arc<dyn GpuTexture> {
        &self.guard.slots[self.index].texture
    }
}

impl Drop for PresentingLease<'_> {
    fn drop(&mut self) {
        self.guard.slots[self.index].pending_readback = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gpu::testing::MockDevice;

    #[test]
    fn rotation_is_fixed_round_robin() {
        let device = MockDevice::with_fences();
        let chain = Swapchain::new(&device, PhysicalSize::new(8, 8)).unwrap();

        let order: Vec<usize> = (0..8).map(|_| chain.acquire_render_target().index).collect();
        assert_eq!(order, vec![1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn render_acquire_skips_presenting_slot() {
        let device = MockDevice::with_fences();
        let chain = Swapchain::new(&device, PhysicalSize::new(8, 8)).unwrap();

        // Render into slot 1, present it, keep rotating: slot 1 must be
        // skipped on the next lap.
        let slot = chain.acquire_render_target();
        assert_eq!(slot.index, 1);
        chain.finish_render(slot.index);
        drop(chain.acquire_presenting_slot().unwrap());

        let next: Vec<usize> = (0..3).map(|_| chain.acquire_render_target().index).collect();
        assert_eq!(next, vec![2, 3, 0]);
        // Slot 1 is still marked presenting; rotation jumps over it.
        assert_eq!(chain.acquire_render_target().index, 2);
    }

    #[test]
    fn lease_exposes_most_recently_finished_slot() {
        let device = MockDevice::with_fences();
        let chain = Swapchain::new(&device, PhysicalSize::new(8, 8)).unwrap();

        assert!(chain.acquire_presenting_slot().is_none());

        let first = chain.acquire_render_target();
        chain.finish_render(first.index);
        let second = chain.acquire_render_target();
        chain.finish_render(second.index);

        let lease = chain.acquire_presenting_slot().unwrap();
        assert_eq!(lease.index(), second.index);
    }
}
