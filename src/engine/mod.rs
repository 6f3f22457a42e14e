/// ### English
/// Engine internal modules (GPU seam, swapchain, frame-completion tracking,
/// presentation, readback, and the external-collaborator contracts).
///
/// ### 中文
/// 引擎内部模块（GPU 接缝、交换链、帧完成跟踪、呈现、回读，以及外部协作者契约）。
pub mod context;
pub mod error;
pub mod fence;
pub mod gpu;
pub mod handles;
pub mod layout;
pub mod present;
pub mod readback;
pub mod scene;
pub mod script;
pub mod swapchain;
pub mod target;
pub mod workers;
