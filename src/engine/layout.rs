//! ### English
//! Layout-engine adapter contract.
//!
//! The layout engine is another external collaborator; the engine only
//! shuttles constraints in and computed boxes out, registers host measure
//! functions, and forwards dirty notifications. No layout math lives here.
//!
//! ### 中文
//! 布局引擎适配契约。
//!
//! 布局引擎同样是外部协作者；引擎只负责传入约束、传出计算结果、注册宿主测量
//! 函数并转发脏标记通知。这里不包含任何布局算法。

use std::ffi::c_void;

/// ### English
/// Box constraints handed to a layout pass. `NaN`-free; unbounded axes use
/// `f32::INFINITY`.
///
/// ### 中文
/// 布局过程的盒约束。不含 `NaN`；无界的轴使用 `f32::INFINITY`。
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayoutConstraints {
    pub min_width: f32,
    pub min_height: f32,
    pub max_width: f32,
    pub max_height: f32,
}

/// ### English
/// One computed layout box, relative to the parent.
///
/// ### 中文
/// 一个已计算的布局盒，坐标相对父节点。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ComputedLayout {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// ### English
/// Host measure function: given constraints, returns the content's intrinsic
/// size through the out-parameter. Registered per node token.
///
/// ### 中文
/// 宿主测量函数：给定约束，通过出参返回内容的固有尺寸。按节点令牌注册。
pub type MeasureCallback =
    extern "C" fn(user_data: *mut c_void, constraints: LayoutConstraints, out: *mut ComputedLayout);

/// Host notification that a node's layout inputs changed.
pub type LayoutDirtyCallback = extern "C" fn(user_data: *mut c_void, node: u64);

/// ### English
/// The narrow contract a layout engine implementation fulfills.
///
/// ### 中文
/// 布局引擎实现需要满足的窄契约。
pub trait LayoutEngine: Send {
    fn compute_layout(&mut self, node: u64, constraints: LayoutConstraints) -> ComputedLayout;

    /// Registers the measure function used for leaf content under `node`.
    fn set_measure_function(
        &mut self,
        node: u64,
        callback: Option<MeasureCallback>,
        user_data: *mut c_void,
    );

    fn mark_dirty(&mut self, node: u64);
}

/// ### English
/// Dirty-notification fan-out back to the host. One callback slot, same shape
/// as the frame observer.
///
/// ### 中文
/// 回送宿主的脏标记通知。单回调槽位，形制与帧观察者一致。
pub struct LayoutObserver {
    callback: Option<LayoutDirtyCallback>,
    user_data: *mut c_void,
}

unsafe impl Send for LayoutObserver {}

impl LayoutObserver {
    pub fn new(callback: Option<LayoutDirtyCallback>, user_data: *mut c_void) -> Self {
        Self { callback, user_data }
    }

    pub fn notify(&self, node: u64) {
        if let Some(callback) = self.callback {
            callback(self.user_data, node);
        }
    }
}
