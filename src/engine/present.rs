//! ### English
//! Presentation coordination.
//!
//! Orchestrates begin-frame → submit → completion wait → publish → notify.
//! In hardware-fence mode the wait runs on a dedicated background worker fed
//! through a single-slot mailbox (mutex + condvar); in fallback mode the wait
//! collapses into a blocking call on the render thread. At most one frame is
//! ever in flight: the render thread blocks on `Idle` before submitting
//! again, which is the sole backpressure mechanism. Every submitted frame is
//! published exactly once, in submission order.
//!
//! ### 中文
//! 呈现协调。
//!
//! 编排 begin-frame → 提交 → 完成等待 → 发布 → 通知。硬件 fence 模式下，等待
//! 运行在专用后台 worker 上，通过单槽邮箱（mutex + 条件变量）投递；回退模式下，
//! 等待塌缩为渲染线程上的阻塞调用。任一时刻至多一帧在途：渲染线程在再次提交前
//! 会阻塞等待 `Idle`，这是唯一的背压机制。每个已提交的帧严格按提交顺序、且恰好
//! 发布一次。

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use dpi::PhysicalSize;

use crate::engine::error::EngineError;
use crate::engine::fence::FrameFenceTracker;
use crate::engine::gpu::FrameIndex;
use crate::engine::swapchain::{PresentingLease, Swapchain};

/// ### English
/// Reserved mailbox sentinel telling the worker to exit. Frame indices are
/// monotonic from 1, so the sentinel can never collide with a real frame.
///
/// ### 中文
/// 保留的邮箱哨兵值，通知 worker 退出。帧序号从 1 单调递增，哨兵值不可能与真实
/// 帧冲突。
const TERMINATE_INDEX: FrameIndex = u64::MAX;

/// ### English
/// Host completion callback: fired exactly once per submitted frame, with
/// the opaque token registered at render-target creation.
///
/// ### 中文
/// 宿主完成回调：每个已提交帧恰好触发一次，携带创建渲染目标时登记的不透明令牌。
pub type FrameAvailableCallback = extern "C" fn(user_data: *mut c_void);

/// ### English
/// Single observer slot per render target: one callback plus a stable
/// opaque user-data token. No dynamic dispatch beyond this one slot.
///
/// ### 中文
/// 每个渲染目标一个观察者槽位——一个回调加一个稳定的不透明 user-data 令牌。
/// 除此之外没有任何动态分发。
pub struct FrameObserver {
    callback: Option<FrameAvailableCallback>,
    user_data: *mut c_void,
}

// The token is only ever handed back to the host callback; the observer
// itself never dereferences it.
unsafe impl Send for FrameObserver {}

impl FrameObserver {
    pub fn new(callback: Option<FrameAvailableCallback>, user_data: *mut c_void) -> Self {
        Self { callback, user_data }
    }

    pub fn notify(&self) {
        if let Some(callback) = self.callback {
            callback(self.user_data);
        }
    }
}

/// ### English
/// One "publish to host" capability. Two interchangeable implementations:
/// CPU readback into a pixel buffer, or direct shared-texture export.
/// Selected once at target construction from a runtime capability probe.
///
/// ### 中文
/// 单一的“发布给宿主”能力。两个可互换实现：CPU 回读到像素缓冲区，或直接导出
/// 共享纹理。在目标构造时依据一次运行时能力探测选定。
pub trait FramePublisher: Send {
    fn publish(&mut self, lease: &PresentingLease<'_>) -> Result<(), EngineError>;
}

/// ### English
/// Publish strategy for devices that can hand render textures straight to
/// the host compositor: exports the presenting slot's native handle.
///
/// ### 中文
/// 适用于可把渲染纹理直接交给宿主合成器的设备的发布策略：导出呈现槽位的原生句柄。
pub struct SharedTexturePublisher {
    output: Arc<SharedTextureOutput>,
}

impl SharedTexturePublisher {
    pub fn new(output: Arc<SharedTextureOutput>) -> Self {
        Self { output }
    }
}

impl FramePublisher for SharedTexturePublisher {
    fn publish(&mut self, lease: &PresentingLease<'_>) -> Result<(), EngineError> {
        let texture = lease.texture();
        let size = texture.size();
        self.output.width.store(size.width, Ordering::Relaxed);
        self.output.height.store(size.height, Ordering::Relaxed);
        self.output
            .handle
            .store(texture.native_handle(), Ordering::Release);
        Ok(())
    }
}

/// ### English
/// Latest exported shared-texture handle, read by the host between
/// completion callbacks.
///
/// ### 中文
/// 最近导出的共享纹理句柄，供宿主在完成回调之间读取。
#[derive(Default)]
pub struct SharedTextureOutput {
    handle: AtomicU64,
    width: AtomicU32,
    height: AtomicU32,
}

impl SharedTextureOutput {
    pub fn latest(&self) -> (u64, PhysicalSize<u32>) {
        let handle = self.handle.load(Ordering::Acquire);
        let size = PhysicalSize::new(
            self.width.load(Ordering::Relaxed),
            self.height.load(Ordering::Relaxed),
        );
        (handle, size)
    }
}

#[derive(Clone, Copy)]
struct PendingFrame {
    /// 0 = idle, TERMINATE_INDEX = terminating, anything else = frame index.
    frame: FrameIndex,
    slot: usize,
}

/// ### English
/// Everything the publishing side touches. Kept under one mutex so that only
/// one of Waiting/Publishing is ever active, regardless of which thread runs
/// it; GPU context calls need no further locking.
///
/// ### 中文
/// 发布侧触碰的全部状态。放在同一把互斥锁下，保证无论哪个线程执行，
/// Waiting/Publishing 任一时刻只有一个处于活动状态；GPU 上下文调用不需要额外加锁。
struct PublishSide {
    publisher: Box<dyn FramePublisher>,
    observer: FrameObserver,
}

struct CoordinatorShared {
    mailbox: Mutex<PendingFrame>,
    mailbox_cond: Condvar,
    publish_side: Mutex<PublishSide>,
    swapchain: Arc<Swapchain>,
    tracker: Arc<FrameFenceTracker>,
}

impl CoordinatorShared {
    fn wait_and_publish(&self, pending: PendingFrame) {
        // Waiting: block until the GPU has executed this frame.
        let completed = self.tracker.wait_for(pending.frame);

        // Publishing: copy/export under the slot lease, then notify. A
        // transient GPU failure skips the publish (stale contents stay
        // visible) but the callback still fires exactly once per frame.
        let mut side = self.publish_side.lock().unwrap();
        match completed {
            Ok(()) => {
                let lease = self.swapchain.begin_present(pending.slot);
                if let Err(err) = side.publisher.publish(&lease) {
                    log::warn!("skipping publish of frame {}: {err}", pending.frame);
                }
            }
            Err(err) => {
                log::warn!("frame {} completion wait failed: {err}", pending.frame);
            }
        }
        side.observer.notify();
    }

    fn worker_loop(&self) {
        loop {
            // Block until the render thread posts a frame to wait on.
            let pending = {
                let mut mailbox = self.mailbox.lock().unwrap();
                while mailbox.frame == 0 {
                    mailbox = self.mailbox_cond.wait(mailbox).unwrap();
                }
                *mailbox
            };

            if pending.frame == TERMINATE_INDEX {
                break;
            }

            self.wait_and_publish(pending);

            // Back to Idle; wake a render thread blocked on backpressure.
            {
                let mut mailbox = self.mailbox.lock().unwrap();
                mailbox.frame = 0;
            }
            self.mailbox_cond.notify_all();
        }
    }
}

/// ### English
/// Coordinates submit → wait → publish → notify for one render target.
///
/// State machine: Idle → WaitRequested → Waiting → Publishing → Idle, or
/// Idle → Terminating → Terminated. The background worker exists only in
/// hardware-fence mode; fallback mode runs Waiting/Publishing inline on the
/// render thread.
///
/// ### 中文
/// 为单个渲染目标协调提交 → 等待 → 发布 → 通知。
///
/// 状态机：Idle → WaitRequested → Waiting → Publishing → Idle，或
/// Idle → Terminating → Terminated。后台 worker 只在硬件 fence 模式下存在；
/// 回退模式在渲染线程内联执行 Waiting/Publishing。
pub struct PresentationCoordinator {
    shared: Arc<CoordinatorShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PresentationCoordinator {
    pub fn new(
        swapchain: Arc<Swapchain>,
        tracker: Arc<FrameFenceTracker>,
        publisher: Box<dyn FramePublisher>,
        observer: FrameObserver,
    ) -> Self {
        let shared = Arc::new(CoordinatorShared {
            mailbox: Mutex::new(PendingFrame { frame: 0, slot: 0 }),
            mailbox_cond: Condvar::new(),
            publish_side: Mutex::new(PublishSide {
                publisher,
                observer,
            }),
            swapchain,
            tracker,
        });

        let worker = if shared.tracker.has_hardware_fences() {
            let worker_shared = shared.clone();
            Some(
                thread::Builder::new()
                    .name("vexel-present".into())
                    .spawn(move || worker_shared.worker_loop())
                    .expect("failed to spawn presentation worker"),
            )
        } else {
            None
        };

        Self { shared, worker }
    }

    /// ### English
    /// Blocks until no frame is in flight. The render thread calls this
    /// before beginning a new frame; this is the sole backpressure point, bounding
    /// in-flight frames to one. Returns `Err(Terminated)` during shutdown.
    ///
    /// ### 中文
    /// 阻塞直到没有在途帧。渲染线程在开始新帧前调用——这是唯一的背压点，把在途
    /// 帧数量限制为 1。关闭期间返回 `Err(Terminated)`。
    pub fn wait_idle(&self) -> Result<(), EngineError> {
        let mut mailbox = self.shared.mailbox.lock().unwrap();
        loop {
            match mailbox.frame {
                0 => return Ok(()),
                TERMINATE_INDEX => return Err(EngineError::Terminated),
                _ => mailbox = self.shared.mailbox_cond.wait(mailbox).unwrap(),
            }
        }
    }

    /// ### English
    /// Hands a submitted frame to the completion pipeline. Hardware mode:
    /// posts the index into the mailbox and wakes the worker. Fallback mode:
    /// waits, publishes, and notifies synchronously before returning.
    /// Precondition: the mailbox is idle (callers go through `wait_idle`);
    /// a frame submitted after termination began is dropped without a
    /// callback.
    ///
    /// ### 中文
    /// 把已提交的帧交给完成管线。硬件模式：把序号写入邮箱并唤醒 worker。回退
    /// 模式：在返回前同步等待、发布并通知。前置条件：邮箱处于空闲
    /// （调用方先经过 `wait_idle`）；终止开始后提交的帧会被丢弃且不触发回调。
    pub fn submit_frame(&self, frame: FrameIndex, slot: usize) -> Result<(), EngineError> {
        if self.worker.is_none() {
            // Fallback (or already shut down): check the sentinel, then run
            // Waiting/Publishing inline.
            if self.shared.mailbox.lock().unwrap().frame == TERMINATE_INDEX {
                return Err(EngineError::Terminated);
            }
            self.shared.wait_and_publish(PendingFrame { frame, slot });
            return Ok(());
        }

        {
            let mut mailbox = self.shared.mailbox.lock().unwrap();
            match mailbox.frame {
                0 => {}
                TERMINATE_INDEX => return Err(EngineError::Terminated),
                _ => {
                    debug_assert!(false, "frame submitted while previous still in flight");
                    while mailbox.frame != 0 {
                        if mailbox.frame == TERMINATE_INDEX {
                            return Err(EngineError::Terminated);
                        }
                        mailbox = self.shared.mailbox_cond.wait(mailbox).unwrap();
                    }
                }
            }
            *mailbox = PendingFrame { frame, slot };
        }
        self.shared.mailbox_cond.notify_all();
        Ok(())
    }

    /// ### English
    /// Termination handshake: drain the in-flight frame, post the sentinel,
    /// join the worker. Only after this returns may the owner release GPU
    /// objects the worker might reference; join-before-release makes the
    /// teardown race impossible by construction.
    ///
    /// ### 中文
    /// 终止握手：先排空在途帧，再投递哨兵值并 join worker。只有在本函数返回后，
    /// 持有者才能释放 worker 可能引用的 GPU 对象——join 先于释放，从构造上杜绝
    /// 销毁竞态。
    pub fn shutdown(&mut self) {
        let worker = self.worker.take();

        {
            let mut mailbox = self.shared.mailbox.lock().unwrap();
            while mailbox.frame != 0 && mailbox.frame != TERMINATE_INDEX {
                mailbox = self.shared.mailbox_cond.wait(mailbox).unwrap();
            }
            mailbox.frame = TERMINATE_INDEX;
        }
        self.shared.mailbox_cond.notify_all();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for PresentationCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gpu::testing::{MockDevice, observer_for};
    use dpi::PhysicalSize;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct CountingPublisher {
        published: Arc<Mutex<Vec<usize>>>,
    }

    impl FramePublisher for CountingPublisher {
        fn publish(&mut self, lease: &PresentingLease<'_>) -> Result<(), EngineError> {
            self.published.lock().unwrap().push(lease.index());
            Ok(())
        }
    }

    fn coordinator_over(
        device: &MockDevice,
    ) -> (PresentationCoordinator, Arc<Mutex<Vec<usize>>>, Arc<AtomicUsize>) {
        let swapchain = Arc::new(Swapchain::new(device, PhysicalSize::new(8, 8)).unwrap());
        let tracker = Arc::new(FrameFenceTracker::new(device).unwrap());
        let published = Arc::new(Mutex::new(Vec::new()));
        let (observer, fired) = observer_for();
        let coordinator = PresentationCoordinator::new(
            swapchain,
            tracker,
            Box::new(CountingPublisher {
                published: published.clone(),
            }),
            observer,
        );
        (coordinator, published, fired)
    }

    #[test]
    fn single_frame_in_flight_blocks_second_submit() {
        let device = MockDevice::with_manual_fences();
        let (coordinator, _published, fired) = coordinator_over(&device);

        coordinator.wait_idle().unwrap();
        coordinator.submit_frame(1, 1).unwrap();

        // The worker is parked inside wait_for(1); a second wait_idle must
        // not return until the fence resolves.
        let started = Instant::now();
        let resolver = {
            let device = device.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                device.resolve_fence(1);
            })
        };
        coordinator.wait_idle().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        resolver.join().unwrap();
    }

    #[test]
    fn shutdown_mid_wait_joins_cleanly_and_drops_late_frames() {
        let device = MockDevice::with_manual_fences();
        let (mut coordinator, _published, fired) = coordinator_over(&device);

        coordinator.submit_frame(1, 1).unwrap();

        let resolver = {
            let device = device.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                device.resolve_fence(1);
            })
        };

        // Shutdown blocks until the in-flight frame resolves, then joins.
        coordinator.shutdown();
        resolver.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A frame submitted after termination began never fires a callback.
        assert!(matches!(
            coordinator.submit_frame(2, 2),
            Err(EngineError::Terminated)
        ));
        assert!(matches!(coordinator.wait_idle(), Err(EngineError::Terminated)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_mode_publishes_synchronously_in_order() {
        let device = MockDevice::without_fences();
        let (coordinator, published, fired) = coordinator_over(&device);

        device.resolve_query_after_polls(0);
        coordinator.wait_idle().unwrap();
        coordinator.submit_frame(1, 1).unwrap();
        // Fallback is fully synchronous: the callback fired before
        // submit_frame returned.
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        device.resolve_query_after_polls(0);
        coordinator.submit_frame(2, 2).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(*published.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn publish_failure_still_fires_the_callback_once() {
        struct FailingPublisher;
        impl FramePublisher for FailingPublisher {
            fn publish(&mut self, _lease: &PresentingLease<'_>) -> Result<(), EngineError> {
                Err(EngineError::Device("injected".into()))
            }
        }

        let device = MockDevice::without_fences();
        let swapchain = Arc::new(Swapchain::new(&device, PhysicalSize::new(8, 8)).unwrap());
        let tracker = Arc::new(FrameFenceTracker::new(&device).unwrap());
        let (observer, fired) = observer_for();
        let coordinator = PresentationCoordinator::new(
            swapchain,
            tracker,
            Box::new(FailingPublisher),
            observer,
        );

        device.resolve_query_after_polls(0);
        coordinator.submit_frame(1, 0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
