//! ### English
//! OpenGL adapter over the host-owned context.
//!
//! The host owns context creation and threading; it hands over a GL proc
//! loader plus a make-current callback, and this adapter implements the
//! device seam on top: render textures with framebuffers, `fence_sync` frame
//! fences, occlusion-query completion fallback, and `read_pixels` readback.
//! Calls are serialized by the presentation state machine, so the adapter
//! makes the context current at each entry point and never locks around GL.
//!
//! ### 中文
//! 基于宿主持有上下文的 OpenGL 适配器。
//!
//! 上下文创建与线程归宿主所有；宿主交出 GL 函数加载器与 make-current 回调，
//! 本适配器在其上实现设备接缝：带 framebuffer 的渲染纹理、`fence_sync` 帧
//! fence、遮挡查询完成回退、以及 `read_pixels` 回读。调用由呈现状态机串行化，
//! 因此适配器在每个入口使上下文 current，且不对 GL 加锁。

use std::ffi::{CString, c_char, c_void};
use std::sync::{Arc, Mutex};

use dpi::PhysicalSize;
use glow::HasContext as _;

use crate::engine::error::EngineError;
use crate::engine::gpu::{
    BYTES_PER_PIXEL, CompletionQuery, Device, FrameFence, FrameIndex, GpuTexture, PixelFormat,
    StagingTexture,
};

/// Host GL proc loader: resolves a NUL-terminated proc name to a pointer.
pub type GlProcLoader =
    extern "C" fn(user_data: *mut c_void, name: *const c_char) -> *const c_void;

/// Host callback making its GL context current on the calling thread.
pub type MakeCurrentCallback = extern "C" fn(user_data: *mut c_void);

/// `client_wait_sync` timeout per attempt, in nanoseconds.
const FENCE_WAIT_SLICE_NS: u64 = 1_000_000_000;

struct HostContext {
    make_current: Option<MakeCurrentCallback>,
    user_data: *mut c_void,
}

// The user-data token is only ever passed back to the host callback.
unsafe impl Send for HostContext {}
unsafe impl Sync for HostContext {}

impl HostContext {
    fn make_current(&self) {
        if let Some(make_current) = self.make_current {
            make_current(self.user_data);
        }
    }
}

struct GlShared {
    glow: Arc<glow::Context>,
    host: HostContext,
    /// Query target chosen at init: `ANY_SAMPLES_PASSED` on GLES, plain
    /// `SAMPLES_PASSED` on desktop GL.
    query_target: u32,
    /// Scratch for the last texture-to-staging read. One slot suffices; the
    /// copy and the map are serialized by the publish path.
    readback_scratch: Mutex<ReadbackScratch>,
}

#[derive(Default)]
struct ReadbackScratch {
    bytes: Vec<u8>,
    size: PhysicalSize<u32>,
}

// GL objects move between the render thread and the presentation worker, but
// never concurrently; the host's make-current callback rebinds the context.
unsafe impl Send for GlShared {}
unsafe impl Sync for GlShared {}

/// ### English
/// [`Device`] implementation over a host-supplied OpenGL context.
///
/// ### 中文
/// 基于宿主提供 OpenGL 上下文的 [`Device`] 实现。
pub struct GlDevice {
    shared: Arc<GlShared>,
}

impl GlDevice {
    /// ### English
    /// Loads GL over the host's proc loader. Must be called with the host
    /// context current (the make-current callback is invoked first).
    ///
    /// ### 中文
    /// 通过宿主的函数加载器加载 GL。调用时宿主上下文须为 current
    /// （会先调用 make-current 回调）。
    pub fn new(
        loader: GlProcLoader,
        make_current: Option<MakeCurrentCallback>,
        user_data: *mut c_void,
    ) -> Result<Self, EngineError> {
        let host = HostContext {
            make_current,
            user_data,
        };
        host.make_current();

        let glow = unsafe {
            glow::Context::from_loader_function(|name| {
                let cstr = CString::new(name).expect("gl proc name contains NUL");
                loader(user_data, cstr.as_ptr())
            })
        };

        let version = unsafe { glow.get_parameter_string(glow::VERSION) };
        if version.is_empty() {
            return Err(EngineError::Device("gl context reported no version".into()));
        }
        let query_target = if version.starts_with("OpenGL ES") {
            glow::ANY_SAMPLES_PASSED
        } else {
            glow::SAMPLES_PASSED
        };
        log::debug!("gl adapter initialized over {version}");

        Ok(Self {
            shared: Arc::new(GlShared {
                glow: Arc::new(glow),
                host,
                query_target,
                readback_scratch: Mutex::new(ReadbackScratch::default()),
            }),
        })
    }
}

impl Device for GlDevice {
    fn create_render_texture(
        &self,
        size: PhysicalSize<u32>,
        clear: bool,
    ) -> Result<Arc<dyn GpuTexture>, EngineError> {
        let shared = &self.shared;
        shared.host.make_current();
        let glow = &shared.glow;

        unsafe {
            let texture = glow.create_texture().map_err(EngineError::Device)?;
            glow.bind_texture(glow::TEXTURE_2D, Some(texture));
            glow.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                size.width as i32,
                size.height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(None),
            );
            glow.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MIN_FILTER,
                glow::LINEAR as i32,
            );
            glow.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MAG_FILTER,
                glow::LINEAR as i32,
            );

            let framebuffer = glow.create_framebuffer().map_err(EngineError::Device)?;
            glow.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            glow.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            if glow.check_framebuffer_status(glow::FRAMEBUFFER) != glow::FRAMEBUFFER_COMPLETE {
                glow.delete_framebuffer(framebuffer);
                glow.delete_texture(texture);
                return Err(EngineError::Device("render framebuffer incomplete".into()));
            }
            if clear {
                glow.clear_color(0.0, 0.0, 0.0, 0.0);
                glow.clear(glow::COLOR_BUFFER_BIT);
            }
            glow.bind_framebuffer(glow::FRAMEBUFFER, None);

            Ok(Arc::new(GlTexture {
                shared: shared.clone(),
                texture,
                framebuffer,
                size,
            }))
        }
    }

    fn clear_render_texture(
        &self,
        texture: &dyn GpuTexture,
        argb: u32,
    ) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.host.make_current();

        let [a, r, g, b] = argb.to_be_bytes().map(|c| c as f32 / 255.0);
        unsafe {
            let framebuffer = shared.glow.create_framebuffer().map_err(EngineError::Device)?;
            shared.glow.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            shared.glow.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(glow::NativeTexture(
                    std::num::NonZeroU32::new(texture.native_handle() as u32)
                        .ok_or_else(|| EngineError::Device("texture has no gl name".into()))?,
                )),
                0,
            );
            shared.glow.clear_color(r, g, b, a);
            shared.glow.clear(glow::COLOR_BUFFER_BIT);
            shared.glow.bind_framebuffer(glow::FRAMEBUFFER, None);
            shared.glow.delete_framebuffer(framebuffer);
        }
        Ok(())
    }

    fn try_create_frame_fence(&self) -> Option<Box<dyn FrameFence>> {
        self.shared.host.make_current();
        // Probe by creating one throwaway sync object.
        let probe = unsafe { self.shared.glow.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) };
        match probe {
            Ok(sync) => {
                unsafe { self.shared.glow.delete_sync(sync) };
                Some(Box::new(GlFrameFence {
                    shared: self.shared.clone(),
                    pending: Mutex::new(Vec::new()),
                }))
            }
            Err(_) => None,
        }
    }

    fn create_completion_query(&self) -> Result<Box<dyn CompletionQuery>, EngineError> {
        self.shared.host.make_current();
        let query = unsafe { self.shared.glow.create_query() }.map_err(EngineError::Device)?;
        Ok(Box::new(GlCompletionQuery {
            shared: self.shared.clone(),
            query,
        }))
    }

    fn create_staging_texture(
        &self,
        size: PhysicalSize<u32>,
        format: PixelFormat,
    ) -> Result<Box<dyn StagingTexture>, EngineError> {
        Ok(Box::new(GlStaging {
            shared: self.shared.clone(),
            size,
            format,
        }))
    }

    fn copy_texture_to_staging(
        &self,
        source: &dyn GpuTexture,
        staging: &mut dyn StagingTexture,
    ) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.host.make_current();

        let size = source.size();
        if size != staging.size() {
            return Err(EngineError::Device("staging size mismatch".into()));
        }
        let len = size.width as usize * size.height as usize * BYTES_PER_PIXEL;

        let mut scratch = shared.readback_scratch.lock().unwrap();
        scratch.bytes.resize(len, 0);
        scratch.size = size;

        unsafe {
            // Transient read framebuffer over the source texture.
            let framebuffer = shared.glow.create_framebuffer().map_err(EngineError::Device)?;
            shared.glow.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(framebuffer));
            shared.glow.framebuffer_texture_2d(
                glow::READ_FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(glow::NativeTexture(
                    std::num::NonZeroU32::new(source.native_handle() as u32)
                        .ok_or_else(|| EngineError::Device("texture has no gl name".into()))?,
                )),
                0,
            );
            shared.glow.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            shared.glow.read_pixels(
                0,
                0,
                size.width as i32,
                size.height as i32,
                glow::BGRA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(scratch.bytes.as_mut_slice())),
            );
            shared.glow.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            shared.glow.delete_framebuffer(framebuffer);
        }
        Ok(())
    }

    fn flush(&self) {
        self.shared.host.make_current();
        unsafe { self.shared.glow.flush() };
    }

    fn supports_shared_textures(&self) -> bool {
        // The host shares the GL object namespace; texture names can be
        // sampled from its context directly.
        true
    }
}

struct GlTexture {
    shared: Arc<GlShared>,
    texture: glow::NativeTexture,
    framebuffer: glow::NativeFramebuffer,
    size: PhysicalSize<u32>,
}

impl GpuTexture for GlTexture {
    fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Bgra8
    }

    fn native_handle(&self) -> u64 {
        self.texture.0.get() as u64
    }
}

impl Drop for GlTexture {
    fn drop(&mut self) {
        self.shared.host.make_current();
        unsafe {
            self.shared.glow.delete_framebuffer(self.framebuffer);
            self.shared.glow.delete_texture(self.texture);
        }
    }
}

/// One sync object per signaled frame, waited and deleted in order.
struct GlFrameFence {
    shared: Arc<GlShared>,
    /// Sync pointers stored as usize so the list can cross threads.
    pending: Mutex<Vec<(FrameIndex, usize)>>,
}

impl FrameFence for GlFrameFence {
    fn signal(&self, value: FrameIndex) -> Result<(), EngineError> {
        self.shared.host.make_current();
        let sync = unsafe { self.shared.glow.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) }
            .map_err(EngineError::Device)?;
        self.pending
            .lock()
            .unwrap()
            .push((value, sync.0 as usize));
        Ok(())
    }

    fn wait(&self, value: FrameIndex) -> Result<(), EngineError> {
        self.shared.host.make_current();
        let due: Vec<(FrameIndex, usize)> = {
            let mut pending = self.pending.lock().unwrap();
            let split = pending.partition_point(|(v, _)| *v <= value);
            pending.drain(..split).collect()
        };

        for (frame, raw_sync) in due {
            let sync = glow::NativeFence(raw_sync as *mut _);
            loop {
                let status = unsafe {
                    self.shared.glow.client_wait_sync(
                        sync,
                        glow::SYNC_FLUSH_COMMANDS_BIT,
                        FENCE_WAIT_SLICE_NS as i32,
                    )
                };
                match status {
                    glow::ALREADY_SIGNALED | glow::CONDITION_SATISFIED => break,
                    glow::TIMEOUT_EXPIRED => continue,
                    _ => {
                        unsafe { self.shared.glow.delete_sync(sync) };
                        return Err(EngineError::Device(format!(
                            "client_wait_sync failed for frame {frame}"
                        )));
                    }
                }
            }
            unsafe { self.shared.glow.delete_sync(sync) };
        }
        Ok(())
    }
}

impl Drop for GlFrameFence {
    fn drop(&mut self) {
        self.shared.host.make_current();
        for (_, raw_sync) in self.pending.lock().unwrap().drain(..) {
            let sync = glow::NativeFence(raw_sync as *mut _);
            unsafe { self.shared.glow.delete_sync(sync) };
        }
    }
}

struct GlCompletionQuery {
    shared: Arc<GlShared>,
    query: glow::NativeQuery,
}

impl CompletionQuery for GlCompletionQuery {
    fn begin(&mut self) -> Result<(), EngineError> {
        self.shared.host.make_current();
        unsafe {
            self.shared
                .glow
                .begin_query(self.shared.query_target, self.query);
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), EngineError> {
        self.shared.host.make_current();
        unsafe { self.shared.glow.end_query(self.shared.query_target) };
        Ok(())
    }

    fn is_complete(&mut self) -> Result<bool, EngineError> {
        self.shared.host.make_current();
        let available = unsafe {
            self.shared
                .glow
                .get_query_parameter_u32(self.query, glow::QUERY_RESULT_AVAILABLE)
        };
        Ok(available != 0)
    }
}

impl Drop for GlCompletionQuery {
    fn drop(&mut self) {
        self.shared.host.make_current();
        unsafe { self.shared.glow.delete_query(self.query) };
    }
}

/// ### English
/// Staging view over the device's readback scratch. GL's `read_pixels` lands
/// tightly packed rows straight into client memory, so the row pitch equals
/// `width * BYTES_PER_PIXEL`.
///
/// ### 中文
/// 设备回读暂存区之上的 staging 视图。GL 的 `read_pixels` 将紧密排列的行直接
/// 写入客户端内存，因此行距等于 `width * BYTES_PER_PIXEL`。
struct GlStaging {
    shared: Arc<GlShared>,
    size: PhysicalSize<u32>,
    format: PixelFormat,
}

impl StagingTexture for GlStaging {
    fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn with_mapped(&mut self, reader: &mut dyn FnMut(&[u8], usize)) -> Result<(), EngineError> {
        let scratch = self.shared.readback_scratch.lock().unwrap();
        if scratch.size != self.size {
            return Err(EngineError::Map("no readback pending for this size".into()));
        }
        reader(&scratch.bytes, self.size.width as usize * BYTES_PER_PIXEL);
        Ok(())
    }
}
