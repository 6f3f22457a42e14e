//! ### English
//! Scripted GPU doubles for the presentation tests.
//!
//! [`MockDevice`] implements the full [`Device`] seam with controllable fence
//! resolution, completion-query polling, padded staging row pitch, and
//! failure injection, so the acquire/submit/wait/publish protocol can be
//! exercised without a real GPU context.
//!
//! ### 中文
//! 呈现测试用的脚本化 GPU 测试替身。
//!
//! [`MockDevice`] 实现完整的 [`Device`] 接缝，支持可控的 fence 解析、完成查询
//! 轮询、带填充的 staging 行距以及故障注入，使 acquire/submit/wait/publish
//! 协议无需真实 GPU 上下文即可被验证。

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use dpi::PhysicalSize;

use crate::engine::error::EngineError;
use crate::engine::gpu::{
    BYTES_PER_PIXEL, CompletionQuery, Device, FrameFence, FrameIndex, GpuTexture, PixelFormat,
    StagingTexture,
};
use crate::engine::present::FrameObserver;

/// Staging rows carry this many extra bytes past `width * BYTES_PER_PIXEL`,
/// filled with [`ROW_PAD_BYTE`], to expose row-pitch handling bugs.
pub const ROW_PAD_BYTES: usize = 12;

/// Marker byte in staging row padding. Must never appear in published pixels.
pub const ROW_PAD_BYTE: u8 = 0xEE;

#[derive(Clone, Copy, PartialEq)]
enum FenceBehavior {
    /// `try_create_frame_fence` returns `None`.
    Absent,
    /// Fence waits return immediately.
    Immediate,
    /// Fence waits block until [`MockDevice::resolve_fence`] is called.
    Manual,
}

struct DeviceInner {
    fence_behavior: FenceBehavior,
    fence_probes: AtomicUsize,
    flushes: AtomicUsize,
    signaled: Mutex<Vec<FrameIndex>>,
    /// Highest fence value resolved so far (manual mode).
    fence_resolved: Mutex<FrameIndex>,
    fence_cond: Condvar,
    query_brackets: AtomicUsize,
    query_polls: AtomicUsize,
    /// Polls remaining before the current query bracket reads complete.
    /// `None` means the bracket has not been armed to resolve yet.
    query_polls_remaining: Mutex<Option<usize>>,
    textures: Mutex<Vec<Arc<MockTexture>>>,
    /// Fill byte of the most recent texture-to-staging copy. Copies and maps
    /// are serialized by the publish path, so one slot suffices.
    last_copy_fill: Mutex<Option<u8>>,
    next_handle: AtomicUsize,
    copies: AtomicUsize,
    clears: AtomicUsize,
    fail_next_copy: AtomicBool,
    fail_next_map: AtomicBool,
    /// Trailing bytes withheld from every mapped staging region, modeling
    /// backends whose final mapped row stops at the logical width.
    map_tail_trim: AtomicUsize,
    shared_textures: AtomicBool,
}

/// ### English
/// Scripted [`Device`] double. Cloning shares the underlying state, so a test
/// can resolve fences from a helper thread while the coordinator owns its own
/// handle.
///
/// ### 中文
/// 脚本化的 [`Device`] 替身。克隆共享底层状态，测试可以在辅助线程上解析 fence，
/// 同时协调器持有自己的句柄。
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<DeviceInner>,
}

impl MockDevice {
    fn with_behavior(fence_behavior: FenceBehavior) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                fence_behavior,
                fence_probes: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
                signaled: Mutex::new(Vec::new()),
                fence_resolved: Mutex::new(0),
                fence_cond: Condvar::new(),
                query_brackets: AtomicUsize::new(0),
                query_polls: AtomicUsize::new(0),
                query_polls_remaining: Mutex::new(None),
                textures: Mutex::new(Vec::new()),
                last_copy_fill: Mutex::new(None),
                next_handle: AtomicUsize::new(1),
                copies: AtomicUsize::new(0),
                clears: AtomicUsize::new(0),
                fail_next_copy: AtomicBool::new(false),
                fail_next_map: AtomicBool::new(false),
                map_tail_trim: AtomicUsize::new(0),
                shared_textures: AtomicBool::new(false),
            }),
        }
    }

    /// Device with hardware fences whose waits complete immediately.
    pub fn with_fences() -> Self {
        Self::with_behavior(FenceBehavior::Immediate)
    }

    /// Device with hardware fences that block until [`Self::resolve_fence`].
    pub fn with_manual_fences() -> Self {
        Self::with_behavior(FenceBehavior::Manual)
    }

    /// Device without hardware fences; completion queries only.
    pub fn without_fences() -> Self {
        Self::with_behavior(FenceBehavior::Absent)
    }

    /// Marks all fence values up to `value` as resolved, waking waiters.
    pub fn resolve_fence(&self, value: FrameIndex) {
        let mut resolved = self.inner.fence_resolved.lock().unwrap();
        if *resolved < value {
            *resolved = value;
        }
        drop(resolved);
        self.inner.fence_cond.notify_all();
    }

    /// Arms the current query bracket to read complete after `polls` polls.
    pub fn resolve_query_after_polls(&self, polls: usize) {
        *self.inner.query_polls_remaining.lock().unwrap() = Some(polls);
    }

    /// Fails the next `copy_texture_to_staging` call with a device error.
    pub fn fail_next_copy(&self) {
        self.inner.fail_next_copy.store(true, Ordering::SeqCst);
    }

    /// Fails the next staging map with a map error.
    pub fn fail_next_map(&self) {
        self.inner.fail_next_map.store(true, Ordering::SeqCst);
    }

    /// Withholds `bytes` trailing bytes from every subsequent staging map.
    pub fn trim_mapped_tail(&self, bytes: usize) {
        self.inner.map_tail_trim.store(bytes, Ordering::SeqCst);
    }

    /// Makes `supports_shared_textures` report true.
    pub fn enable_shared_textures(&self) {
        self.inner.shared_textures.store(true, Ordering::SeqCst);
    }

    /// Sets the byte a copy out of `texture` will replicate into every pixel.
    pub fn fill_texture(&self, texture: &dyn GpuTexture, byte: u8) {
        self.fill_texture_by_handle(texture.native_handle(), byte);
    }

    /// Same as [`Self::fill_texture`], addressed by native handle.
    pub fn fill_texture_by_handle(&self, handle: u64, byte: u8) {
        let textures = self.inner.textures.lock().unwrap();
        if let Some(texture) = textures.iter().find(|t| t.handle == handle) {
            texture.fill.store(byte, Ordering::SeqCst);
        }
    }

    pub fn fence_probe_count(&self) -> usize {
        self.inner.fence_probes.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    pub fn signaled_values(&self) -> Vec<FrameIndex> {
        self.inner.signaled.lock().unwrap().clone()
    }

    pub fn query_brackets(&self) -> usize {
        self.inner.query_brackets.load(Ordering::SeqCst)
    }

    pub fn query_poll_count(&self) -> usize {
        self.inner.query_polls.load(Ordering::SeqCst)
    }

    pub fn copy_count(&self) -> usize {
        self.inner.copies.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.inner.clears.load(Ordering::SeqCst)
    }
}

impl Device for MockDevice {
    fn create_render_texture(
        &self,
        size: PhysicalSize<u32>,
        clear: bool,
    ) -> Result<Arc<dyn GpuTexture>, EngineError> {
        let texture = Arc::new(MockTexture {
            handle: self.inner.next_handle.fetch_add(1, Ordering::SeqCst) as u64,
            size,
            fill: AtomicU8::new(if clear { 0 } else { 0xAA }),
        });
        self.inner.textures.lock().unwrap().push(texture.clone());
        Ok(texture)
    }

    fn clear_render_texture(
        &self,
        texture: &dyn GpuTexture,
        argb: u32,
    ) -> Result<(), EngineError> {
        // The mock models contents as one byte; use the blue channel.
        self.fill_texture_by_handle(texture.native_handle(), argb as u8);
        self.inner.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_create_frame_fence(&self) -> Option<Box<dyn FrameFence>> {
        self.inner.fence_probes.fetch_add(1, Ordering::SeqCst);
        match self.inner.fence_behavior {
            FenceBehavior::Absent => None,
            FenceBehavior::Immediate | FenceBehavior::Manual => Some(Box::new(MockFence {
                inner: self.inner.clone(),
            })),
        }
    }

    fn create_completion_query(&self) -> Result<Box<dyn CompletionQuery>, EngineError> {
        Ok(Box::new(MockQuery {
            inner: self.inner.clone(),
            open: false,
        }))
    }

    fn create_staging_texture(
        &self,
        size: PhysicalSize<u32>,
        format: PixelFormat,
    ) -> Result<Box<dyn StagingTexture>, EngineError> {
        let row_pitch = size.width as usize * BYTES_PER_PIXEL + ROW_PAD_BYTES;
        Ok(Box::new(MockStaging {
            inner: self.inner.clone(),
            size,
            format,
            row_pitch,
            bytes: vec![ROW_PAD_BYTE; row_pitch * size.height as usize],
        }))
    }

    fn copy_texture_to_staging(
        &self,
        source: &dyn GpuTexture,
        staging: &mut dyn StagingTexture,
    ) -> Result<(), EngineError> {
        if self.inner.fail_next_copy.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Device("injected copy failure".into()));
        }
        self.inner.copies.fetch_add(1, Ordering::SeqCst);

        let fill = {
            let textures = self.inner.textures.lock().unwrap();
            textures
                .iter()
                .find(|t| t.handle == source.native_handle())
                .map(|t| t.fill.load(Ordering::SeqCst))
                .unwrap_or(0)
        };
        debug_assert_eq!(source.size(), staging.size());
        *self.inner.last_copy_fill.lock().unwrap() = Some(fill);
        Ok(())
    }

    fn flush(&self) {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn supports_shared_textures(&self) -> bool {
        self.inner.shared_textures.load(Ordering::SeqCst)
    }
}

struct MockTexture {
    handle: u64,
    size: PhysicalSize<u32>,
    /// Byte replicated into every pixel component when copied to staging.
    fill: AtomicU8,
}

impl GpuTexture for MockTexture {
    fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Bgra8
    }

    fn native_handle(&self) -> u64 {
        self.handle
    }
}

struct MockFence {
    inner: Arc<DeviceInner>,
}

impl FrameFence for MockFence {
    fn signal(&self, value: FrameIndex) -> Result<(), EngineError> {
        self.inner.signaled.lock().unwrap().push(value);
        if self.inner.fence_behavior == FenceBehavior::Immediate {
            let mut resolved = self.inner.fence_resolved.lock().unwrap();
            if *resolved < value {
                *resolved = value;
            }
        }
        Ok(())
    }

    fn wait(&self, value: FrameIndex) -> Result<(), EngineError> {
        let mut resolved = self.inner.fence_resolved.lock().unwrap();
        while *resolved < value {
            resolved = self.inner.fence_cond.wait(resolved).unwrap();
        }
        Ok(())
    }
}

struct MockQuery {
    inner: Arc<DeviceInner>,
    open: bool,
}

impl CompletionQuery for MockQuery {
    fn begin(&mut self) -> Result<(), EngineError> {
        self.open = true;
        Ok(())
    }

    fn end(&mut self) -> Result<(), EngineError> {
        debug_assert!(self.open, "query bracket ended without begin");
        self.open = false;
        self.inner.query_brackets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_complete(&mut self) -> Result<bool, EngineError> {
        self.inner.query_polls.fetch_add(1, Ordering::SeqCst);
        let mut remaining = self.inner.query_polls_remaining.lock().unwrap();
        match remaining.as_mut() {
            Some(0) => {
                *remaining = None;
                Ok(true)
            }
            Some(polls) => {
                *polls -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

struct MockStaging {
    inner: Arc<DeviceInner>,
    size: PhysicalSize<u32>,
    format: PixelFormat,
    row_pitch: usize,
    bytes: Vec<u8>,
}

impl StagingTexture for MockStaging {
    fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn with_mapped(&mut self, reader: &mut dyn FnMut(&[u8], usize)) -> Result<(), EngineError> {
        if self.inner.fail_next_map.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Map("injected map failure".into()));
        }
        if let Some(fill) = *self.inner.last_copy_fill.lock().unwrap() {
            let width_bytes = self.size.width as usize * BYTES_PER_PIXEL;
            for row in self.bytes.chunks_mut(self.row_pitch) {
                row[..width_bytes].fill(fill);
                row[width_bytes..].fill(ROW_PAD_BYTE);
            }
        }
        let trim = self.inner.map_tail_trim.load(Ordering::SeqCst);
        let len = self.bytes.len().saturating_sub(trim);
        reader(&self.bytes[..len], self.row_pitch);
        Ok(())
    }
}

/// ### English
/// Builds a [`FrameObserver`] whose callback increments the returned counter.
///
/// ### 中文
/// 构建一个 [`FrameObserver`]，其回调会递增返回的计数器。
pub fn observer_for() -> (FrameObserver, Arc<AtomicUsize>) {
    extern "C" fn bump(user_data: *mut c_void) {
        let counter = unsafe { &*(user_data as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let user_data = Arc::into_raw(counter.clone()) as *mut c_void;
    (FrameObserver::new(Some(bump), user_data), counter)
}
