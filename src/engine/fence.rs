//! ### English
//! Frame-completion tracking.
//!
//! Knows when a specific submitted frame's GPU work is done. The hardware
//! path inserts a fence signal per frame and blocks a worker thread on it;
//! the fallback path brackets each submission with a reusable completion
//! query and spin-polls it, a deliberate, documented performance regression
//! for devices without fences.
//!
//! ### 中文
//! 帧完成跟踪。
//!
//! 用于得知某个已提交帧的 GPU 工作何时完成。硬件路径为每帧插入一次 fence
//! signal 并让 worker 线程阻塞等待；回退路径用可复用的完成查询包裹每次提交并
//! 自旋轮询——这是为无 fence 设备刻意保留、并有明确说明的性能退化路径。

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::engine::error::EngineError;
use crate::engine::gpu::{CompletionQuery, Device, FrameFence, FrameIndex};

/// ### English
/// Fixed sleep between completion-query polls in fallback mode. A tuning
/// knob, not adaptive: the fallback path favors predictability over latency.
///
/// ### 中文
/// 回退模式下两次完成查询轮询之间的固定休眠时长。这是一个可调参数，并非自适应：
/// 回退路径偏向可预测性而非延迟。
pub const QUERY_POLL_INTERVAL: Duration = Duration::from_micros(500);

enum FenceMode {
    /// Hardware fences: one signal per frame, CPU wait on the GPU timeline.
    Hardware(Box<dyn FrameFence>),
    /// Fallback: a single reusable query bracketing each frame's submission.
    QueryPoll(Mutex<Box<dyn CompletionQuery>>),
}

/// ### English
/// Detects when the GPU has finished executing the commands for a given
/// frame. One tracker per render-target context; the capability probe runs
/// exactly once, at construction.
///
/// ### 中文
/// 检测 GPU 何时执行完某一帧的命令。每个渲染目标上下文一个 tracker；
/// 能力探测只在构造时进行一次。
pub struct FrameFenceTracker {
    /// Frames submitted for signaling so far. First signaled frame is 1.
    frame_counter: AtomicU64,
    mode: FenceMode,
}

impl FrameFenceTracker {
    pub fn new(device: &dyn Device) -> Result<Self, EngineError> {
        let mode = match device.try_create_frame_fence() {
            Some(fence) => FenceMode::Hardware(fence),
            None => {
                log::debug!("hardware fences unavailable; using completion-query fallback");
                FenceMode::QueryPoll(Mutex::new(device.create_completion_query()?))
            }
        };

        Ok(Self {
            frame_counter: AtomicU64::new(0),
            mode,
        })
    }

    /// ### English
    /// Whether the hardware-fence path was selected at construction. Decides
    /// whether the presentation coordinator runs a background worker.
    ///
    /// ### 中文
    /// 构造时是否选择了硬件 fence 路径。决定呈现协调器是否运行后台 worker。
    pub fn has_hardware_fences(&self) -> bool {
        matches!(self.mode, FenceMode::Hardware(_))
    }

    /// ### English
    /// Increments the frame counter, ties a GPU-side signal (or a query
    /// bracket around the submit flush) to the new value, and returns it.
    /// Called on the render thread only.
    ///
    /// ### 中文
    /// 递增帧计数器，把 GPU 侧 signal（或包裹提交 flush 的查询）绑定到新值并
    /// 返回。只在渲染线程调用。
    pub fn signal_after_submit(&self, device: &dyn Device) -> Result<FrameIndex, EngineError> {
        match &self.mode {
            FenceMode::Hardware(fence) => {
                let index = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
                fence.signal(index)?;
                device.flush();
                Ok(index)
            }
            FenceMode::QueryPoll(query) => {
                let mut query = query.lock().unwrap();
                query.begin()?;
                device.flush();
                query.end()?;
                Ok(self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1)
            }
        }
    }

    /// ### English
    /// Blocks until the GPU has executed up through the signal for `index`.
    /// Hardware mode: a fence wait on the background worker. Fallback mode:
    /// a [`QUERY_POLL_INTERVAL`] spin-poll on the caller's (render) thread.
    ///
    /// ### 中文
    /// 阻塞直到 GPU 执行完 `index` 对应 signal 之前的全部工作。硬件模式：在后台
    /// worker 上等待 fence。回退模式：在调用方（渲染）线程上以
    /// [`QUERY_POLL_INTERVAL`] 间隔自旋轮询。
    pub fn wait_for(&self, index: FrameIndex) -> Result<(), EngineError> {
        match &self.mode {
            FenceMode::Hardware(fence) => fence.wait(index),
            FenceMode::QueryPoll(query) => {
                let mut query = query.lock().unwrap();
                while !query.is_complete()? {
                    std::thread::sleep(QUERY_POLL_INTERVAL);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gpu::testing::MockDevice;
    use dpi::PhysicalSize;

    #[test]
    fn frame_indices_start_at_one_and_are_monotonic() {
        let device = MockDevice::with_fences();
        let tracker = FrameFenceTracker::new(&device).unwrap();
        assert!(tracker.has_hardware_fences());

        assert_eq!(tracker.signal_after_submit(&device).unwrap(), 1);
        assert_eq!(tracker.signal_after_submit(&device).unwrap(), 2);
        assert_eq!(tracker.signal_after_submit(&device).unwrap(), 3);
        assert_eq!(device.signaled_values(), vec![1, 2, 3]);
    }

    #[test]
    fn fallback_mode_brackets_submission_with_a_query() {
        let device = MockDevice::without_fences();
        let tracker = FrameFenceTracker::new(&device).unwrap();
        assert!(!tracker.has_hardware_fences());

        let index = tracker.signal_after_submit(&device).unwrap();
        assert_eq!(index, 1);
        // The query bracket completed: begin, flush, end.
        assert_eq!(device.query_brackets(), 1);
        assert_eq!(device.flush_count(), 1);

        // Query resolves after two polls; wait_for spins until then.
        device.resolve_query_after_polls(2);
        tracker.wait_for(index).unwrap();
        assert!(device.query_poll_count() >= 2);
    }

    #[test]
    fn probe_happens_once_at_construction() {
        let device = MockDevice::with_fences();
        let _tracker = FrameFenceTracker::new(&device).unwrap();
        let _texture = device
            .create_render_texture(PhysicalSize::new(4, 4), false)
            .unwrap();
        assert_eq!(device.fence_probe_count(), 1);
    }
}
