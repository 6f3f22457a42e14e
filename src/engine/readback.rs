//! ### English
//! CPU readback publish strategy.
//!
//! Copies the presenting slot's texture into a staging texture, maps it, and
//! tightens the GPU's padded rows into a contiguous BGRA pixel buffer the
//! host reads between completion callbacks. A failed copy or map skips the
//! frame and leaves the previous pixels in place.
//!
//! ### 中文
//! CPU 回读发布策略。
//!
//! 把呈现槽位的纹理拷贝到 staging 纹理、映射之，并把 GPU 带填充的行压紧为连续的
//! BGRA 像素缓冲区，供宿主在完成回调之间读取。拷贝或映射失败则跳过该帧，保留
//! 上一帧的像素。

use std::sync::{Arc, Mutex};

use dpi::PhysicalSize;

use crate::engine::error::EngineError;
use crate::engine::gpu::{BYTES_PER_PIXEL, Device, PixelFormat, StagingTexture};
use crate::engine::present::FramePublisher;
use crate::engine::swapchain::PresentingLease;

/// ### English
/// Host-visible BGRA pixel buffer for one render target.
///
/// The backing allocation never moves after construction, so the pointer the
/// C ABI hands out stays valid for the target's lifetime; its contents are
/// only guaranteed stable between two completion callbacks.
///
/// ### 中文
/// 单个渲染目标的宿主可见 BGRA 像素缓冲区。
///
/// 底层分配在构造后不再移动，因此 C ABI 交出的指针在目标生命周期内始终有效；
/// 其内容只保证在两次完成回调之间稳定。
pub struct PixelBuffer {
    size: PhysicalSize<u32>,
    bytes: Mutex<Box<[u8]>>,
}

impl PixelBuffer {
    pub fn new(size: PhysicalSize<u32>) -> Self {
        let len = size.width as usize * size.height as usize * BYTES_PER_PIXEL;
        Self {
            size,
            bytes: Mutex::new(vec![0; len].into_boxed_slice()),
        }
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    pub fn byte_len(&self) -> usize {
        self.size.width as usize * self.size.height as usize * BYTES_PER_PIXEL
    }

    /// ### English
    /// Stable pointer to the pixel bytes. The host must only dereference it
    /// between completion callbacks; the buffer is rewritten during publish.
    ///
    /// ### 中文
    /// 指向像素字节的稳定指针。宿主只能在完成回调之间解引用；发布期间缓冲区会被
    /// 重写。
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.lock().unwrap().as_ptr()
    }

    /// Runs `f` over a snapshot view of the pixels.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.lock().unwrap())
    }

    fn write_rows(&self, mapped: &[u8], row_pitch: usize) -> Result<(), EngineError> {
        let width_bytes = self.size.width as usize * BYTES_PER_PIXEL;
        let height = self.size.height as usize;
        if height == 0 || width_bytes == 0 {
            return Ok(());
        }
        // The final mapped row may legally omit its trailing pad bytes, but
        // every row must still cover the logical width. Checked up front so a
        // short map skips the frame without leaving partial rows behind.
        let required = row_pitch * (height - 1) + width_bytes;
        if row_pitch < width_bytes || mapped.len() < required {
            return Err(EngineError::Map(format!(
                "mapped region too short: {} bytes for {}x{} at pitch {}",
                mapped.len(),
                self.size.width,
                self.size.height,
                row_pitch
            )));
        }

        let mut bytes = self.bytes.lock().unwrap();
        for (row, source) in bytes
            .chunks_mut(width_bytes)
            .zip(mapped.chunks(row_pitch))
        {
            row.copy_from_slice(&source[..width_bytes]);
        }
        Ok(())
    }
}

/// ### English
/// Publish strategy that round-trips each presented frame through a staging
/// texture into a [`PixelBuffer`]. The staging texture is created lazily and
/// recreated whenever the source size or format changes.
///
/// ### 中文
/// 把每个呈现帧经 staging 纹理往返写入 [`PixelBuffer`] 的发布策略。staging
/// 纹理惰性创建，并在源尺寸或格式变化时重建。
pub struct ReadbackPublisher {
    device: Arc<dyn Device>,
    staging: Option<Box<dyn StagingTexture>>,
    buffer: Arc<PixelBuffer>,
}

impl ReadbackPublisher {
    pub fn new(device: Arc<dyn Device>, buffer: Arc<PixelBuffer>) -> Self {
        Self {
            device,
            staging: None,
            buffer,
        }
    }

    fn staging_for(
        &mut self,
        size: PhysicalSize<u32>,
        format: PixelFormat,
    ) -> Result<&mut Box<dyn StagingTexture>, EngineError> {
        let stale = match &self.staging {
            Some(staging) => staging.size() != size || staging.format() != format,
            None => true,
        };
        if stale {
            self.staging = Some(self.device.create_staging_texture(size, format)?);
        }
        Ok(self.staging.as_mut().unwrap())
    }
}

impl FramePublisher for ReadbackPublisher {
    fn publish(&mut self, lease: &PresentingLease<'_>) -> Result<(), EngineError> {
        let texture = lease.texture().clone();
        let device = self.device.clone();
        let buffer = self.buffer.clone();
        let staging = self.staging_for(texture.size(), texture.format())?;

        device.copy_texture_to_staging(texture.as_ref(), staging.as_mut())?;

        let mut copied = Ok(());
        staging.with_mapped(&mut |mapped, row_pitch| {
            copied = buffer.write_rows(mapped, row_pitch);
        })?;
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gpu::testing::{MockDevice, ROW_PAD_BYTE, ROW_PAD_BYTES};
    use crate::engine::swapchain::Swapchain;

    fn publish_once(
        device: &MockDevice,
        chain: &Swapchain,
        publisher: &mut ReadbackPublisher,
        fill: u8,
    ) -> Result<(), EngineError> {
        let slot = chain.acquire_render_target();
        device.fill_texture(slot.texture.as_ref(), fill);
        chain.finish_render(slot.index);
        let lease = chain.acquire_presenting_slot().unwrap();
        publisher.publish(&lease)
    }

    #[test]
    fn row_pitch_padding_never_reaches_the_pixel_buffer() {
        let device = MockDevice::with_fences();
        let size = PhysicalSize::new(8, 8);
        let chain = Swapchain::new(&device, size).unwrap();
        let buffer = Arc::new(PixelBuffer::new(size));
        let mut publisher = ReadbackPublisher::new(Arc::new(device.clone()), buffer.clone());

        publish_once(&device, &chain, &mut publisher, 0x5C).unwrap();

        buffer.with_pixels(|pixels| {
            assert_eq!(pixels.len(), 8 * 8 * BYTES_PER_PIXEL);
            assert!(pixels.iter().all(|&b| b == 0x5C));
            assert!(!pixels.contains(&ROW_PAD_BYTE));
        });
    }

    #[test]
    fn failed_copy_leaves_previous_pixels_intact() {
        let device = MockDevice::with_fences();
        let size = PhysicalSize::new(4, 4);
        let chain = Swapchain::new(&device, size).unwrap();
        let buffer = Arc::new(PixelBuffer::new(size));
        let mut publisher = ReadbackPublisher::new(Arc::new(device.clone()), buffer.clone());

        publish_once(&device, &chain, &mut publisher, 0x11).unwrap();

        device.fail_next_copy();
        assert!(publish_once(&device, &chain, &mut publisher, 0x22).is_err());

        buffer.with_pixels(|pixels| assert!(pixels.iter().all(|&b| b == 0x11)));
    }

    #[test]
    fn failed_map_leaves_previous_pixels_intact() {
        let device = MockDevice::with_fences();
        let size = PhysicalSize::new(4, 4);
        let chain = Swapchain::new(&device, size).unwrap();
        let buffer = Arc::new(PixelBuffer::new(size));
        let mut publisher = ReadbackPublisher::new(Arc::new(device.clone()), buffer.clone());

        publish_once(&device, &chain, &mut publisher, 0x33).unwrap();

        device.fail_next_map();
        assert!(publish_once(&device, &chain, &mut publisher, 0x44).is_err());

        buffer.with_pixels(|pixels| assert!(pixels.iter().all(|&b| b == 0x33)));
    }

    #[test]
    fn final_row_without_trailing_pad_still_publishes() {
        let device = MockDevice::with_fences();
        let size = PhysicalSize::new(8, 8);
        let chain = Swapchain::new(&device, size).unwrap();
        let buffer = Arc::new(PixelBuffer::new(size));
        let mut publisher = ReadbackPublisher::new(Arc::new(device.clone()), buffer.clone());

        // The mapped region stops at the last row's logical width, as D3D11
        // maps do. Every pixel is still covered.
        device.trim_mapped_tail(ROW_PAD_BYTES);
        publish_once(&device, &chain, &mut publisher, 0x6D).unwrap();

        buffer.with_pixels(|pixels| assert!(pixels.iter().all(|&b| b == 0x6D)));
    }

    #[test]
    fn truncated_map_skips_the_frame() {
        let device = MockDevice::with_fences();
        let size = PhysicalSize::new(4, 4);
        let chain = Swapchain::new(&device, size).unwrap();
        let buffer = Arc::new(PixelBuffer::new(size));
        let mut publisher = ReadbackPublisher::new(Arc::new(device.clone()), buffer.clone());

        publish_once(&device, &chain, &mut publisher, 0x55).unwrap();

        // Cut into the final row's pixels: the publish must error out, not
        // panic, and the previous frame stays visible.
        device.trim_mapped_tail(ROW_PAD_BYTES + 1);
        assert!(matches!(
            publish_once(&device, &chain, &mut publisher, 0x66),
            Err(EngineError::Map(_))
        ));

        buffer.with_pixels(|pixels| assert!(pixels.iter().all(|&b| b == 0x55)));
    }

    #[test]
    fn staging_is_created_once_for_a_stable_size() {
        let device = MockDevice::with_fences();
        let size = PhysicalSize::new(4, 4);
        let chain = Swapchain::new(&device, size).unwrap();
        let buffer = Arc::new(PixelBuffer::new(size));
        let mut publisher = ReadbackPublisher::new(Arc::new(device.clone()), buffer);

        publish_once(&device, &chain, &mut publisher, 0x01).unwrap();
        publish_once(&device, &chain, &mut publisher, 0x02).unwrap();
        assert_eq!(device.copy_count(), 2);
        assert!(publisher.staging.is_some());
    }
}
