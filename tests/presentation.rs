//! End-to-end presentation pipeline tests over the scripted GPU doubles:
//! steady-state rendering, teardown mid-wait, slow-GPU backpressure, and
//! hardware/fallback mode equivalence.

use std::ffi::c_void;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dpi::PhysicalSize;

use vexel_native::engine::gpu::BYTES_PER_PIXEL;
use vexel_native::engine::gpu::testing::{MockDevice, observer_for};
use vexel_native::engine::present::FrameObserver;
use vexel_native::engine::scene::SceneRenderer;
use vexel_native::engine::readback::PixelBuffer;
use vexel_native::engine::swapchain::Swapchain;
use vexel_native::engine::target::{LoadAction, PublishStrategy, RenderTarget};

fn readback_target(device: &MockDevice, size: PhysicalSize<u32>) -> (RenderTarget, Arc<std::sync::atomic::AtomicUsize>) {
    let (observer, fired) = observer_for();
    let target = RenderTarget::new(
        Arc::new(device.clone()),
        size,
        observer,
        PublishStrategy::Readback,
    )
    .unwrap();
    (target, fired)
}

#[test]
fn steady_state_loop_publishes_every_frame_once() {
    let device = MockDevice::with_fences();
    let (mut target, fired) = readback_target(&device, PhysicalSize::new(8, 8));

    for frame_number in 1..=8u8 {
        let frame = target.begin_frame(LoadAction::Clear(0)).unwrap();
        device.fill_texture_by_handle(frame.native_texture(), frame_number);
        target.end_frame(frame).unwrap();
    }
    // Drains the last in-flight frame and joins the worker.
    target.shutdown();

    assert_eq!(fired.load(Ordering::SeqCst), 8);
    assert_eq!(device.signaled_values(), (1..=8).collect::<Vec<u64>>());
    target
        .pixel_buffer()
        .unwrap()
        .with_pixels(|pixels| assert!(pixels.iter().all(|&b| b == 8)));
}

#[test]
fn each_callback_observes_the_pixels_of_its_own_submission() {
    // The callback itself reads the pixel buffer, so the check covers what
    // the host actually sees at notification time, not the final state.
    struct SnapshotSink {
        buffer: Mutex<Option<Arc<PixelBuffer>>>,
        seen: Mutex<Vec<(u8, bool, usize)>>,
    }

    extern "C" fn record(user_data: *mut c_void) {
        let sink = unsafe { &*(user_data as *const SnapshotSink) };
        let guard = sink.buffer.lock().unwrap();
        let buffer = guard.as_ref().expect("buffer registered before first frame");
        let snapshot =
            buffer.with_pixels(|pixels| (pixels[0], pixels.iter().all(|&b| b == pixels[0]), pixels.len()));
        sink.seen.lock().unwrap().push(snapshot);
    }

    let device = MockDevice::with_manual_fences();
    let size = PhysicalSize::new(64, 64);
    let sink = Arc::new(SnapshotSink {
        buffer: Mutex::new(None),
        seen: Mutex::new(Vec::new()),
    });
    let observer = FrameObserver::new(Some(record), Arc::into_raw(sink.clone()) as *mut c_void);

    let mut target = RenderTarget::new(
        Arc::new(device.clone()),
        size,
        observer,
        PublishStrategy::Readback,
    )
    .unwrap();
    *sink.buffer.lock().unwrap() = Some(target.pixel_buffer().unwrap().clone());

    // Each frame's fence resolves roughly 10 ms apart; frame k cannot be
    // published before its fence resolves.
    let resolver = {
        let device = device.clone();
        thread::spawn(move || {
            for value in 1..=3u64 {
                thread::sleep(Duration::from_millis(10));
                device.resolve_fence(value);
            }
        })
    };

    for fill in 1..=3u8 {
        let frame = target.begin_frame(LoadAction::Preserve).unwrap();
        device.fill_texture_by_handle(frame.native_texture(), fill);
        target.end_frame(frame).unwrap();
    }
    target.shutdown();
    resolver.join().unwrap();

    let bytes = 64 * 64 * BYTES_PER_PIXEL;
    let seen = sink.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![(1, true, bytes), (2, true, bytes), (3, true, bytes)]
    );
}

#[test]
fn teardown_mid_wait_drains_without_late_callbacks() {
    let device = MockDevice::with_manual_fences();
    let (mut target, fired) = readback_target(&device, PhysicalSize::new(4, 4));

    let frame = target.begin_frame(LoadAction::Preserve).unwrap();
    target.end_frame(frame).unwrap();

    let resolver = {
        let device = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.resolve_fence(1);
        })
    };

    // Shutdown blocks until the in-flight frame resolves, publishes it,
    // and joins the worker.
    target.shutdown();
    resolver.join().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The pipeline is terminated; no further frames, no further callbacks.
    assert!(target.begin_frame(LoadAction::Preserve).is_err());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn slow_gpu_backpressure_bounds_frames_in_flight_to_one() {
    let device = MockDevice::with_manual_fences();
    let (mut target, fired) = readback_target(&device, PhysicalSize::new(4, 4));

    let frame = target.begin_frame(LoadAction::Preserve).unwrap();
    target.end_frame(frame).unwrap();

    // The GPU is "slow": the fence for frame 1 stays unsignaled. The next
    // begin_frame must block until it resolves.
    let started = Instant::now();
    let resolver = {
        let device = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            device.resolve_fence(1);
        })
    };

    let second = target.begin_frame(LoadAction::Preserve).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(25));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    device.resolve_fence(2);
    target.end_frame(second).unwrap();
    target.shutdown();
    resolver.join().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn fallback_mode_is_observationally_equivalent() {
    let run = |device: MockDevice| {
        let (mut target, fired) = readback_target(&device, PhysicalSize::new(4, 4));
        for frame_number in 1..=4u8 {
            // No-op in hardware mode; arms the query in fallback mode.
            device.resolve_query_after_polls(0);
            let frame = target.begin_frame(LoadAction::Preserve).unwrap();
            device.fill_texture_by_handle(frame.native_texture(), frame_number);
            target.end_frame(frame).unwrap();
        }
        target.shutdown();
        let last_pixel = target
            .pixel_buffer()
            .unwrap()
            .with_pixels(|pixels| pixels[0]);
        (fired.load(Ordering::SeqCst), last_pixel)
    };

    let hardware = run(MockDevice::with_fences());
    let fallback = run(MockDevice::without_fences());
    assert_eq!(hardware, (4, 4));
    assert_eq!(fallback, (4, 4));
}

#[test]
fn rotation_never_returns_the_presented_slot() {
    let device = MockDevice::with_fences();
    let chain = Swapchain::new(&device, PhysicalSize::new(4, 4)).unwrap();

    let mut presented = None;
    for _ in 0..20 {
        let slot = chain.acquire_render_target();
        if let Some(presented) = presented {
            assert_ne!(slot.index, presented);
        }
        chain.finish_render(slot.index);
        let lease = chain.acquire_presenting_slot().unwrap();
        presented = Some(lease.index());
    }
}
