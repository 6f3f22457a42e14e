//! ### English
//! Scripting-engine embedding contract.
//!
//! The script engine itself is an external collaborator. This module owns the
//! pieces the boundary needs: a console buffer capturing script output as
//! structured binary records, a "console has data" latch that fires at most
//! once per drain, and a wall-clock interrupt budget enforced through the
//! engine's interrupt hook.
//!
//! ### 中文
//! 脚本引擎嵌入契约。
//!
//! 脚本引擎本身是外部协作者。本模块持有边界所需的部分：把脚本输出捕获为结构化
//! 二进制记录的控制台缓冲区、每次排空后至多触发一次的“控制台有数据”闩锁、以及
//! 通过引擎中断钩子强制执行的墙钟预算。
//!
//! Console wire format: a record starts with a tag byte. `0` begins an
//! output line (varuint source token, varuint line number), `1` records a
//! parsed error (varuint-length file, varuint line, varuint-length message).
//! After a line-begin, printed data follows as varuint-length byte runs; a
//! zero length ends the line.

use std::ffi::c_void;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::engine::error::EngineError;

/// ### English
/// Wall-clock budget for one module execution. The interrupt hook trips once
/// the budget is spent; the engine is expected to unwind promptly.
///
/// ### 中文
/// 单次模块执行的墙钟预算。预算耗尽后中断钩子触发；期望引擎尽快退出执行。
pub const SCRIPT_EXECUTION_BUDGET: Duration = Duration::from_millis(50);

const TAG_LINE_BEGIN: u8 = 0;
const TAG_ERROR: u8 = 1;

fn push_varuint(bytes: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        bytes.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Host callback fired when the console transitions from empty to non-empty.
pub type ConsoleDataCallback = extern "C" fn(user_data: *mut c_void);

struct ConsoleObserver {
    callback: Option<ConsoleDataCallback>,
    user_data: *mut c_void,
}

unsafe impl Send for ConsoleObserver {}

struct ConsoleState {
    bytes: Vec<u8>,
    /// Set once the observer fired; cleared on drain.
    notified: bool,
    observer: ConsoleObserver,
}

/// ### English
/// Captures script console output as binary records. The has-data callback
/// fires at most once between drains, so a chatty script cannot flood the
/// host with notifications.
///
/// ### 中文
/// 把脚本控制台输出捕获为二进制记录。“有数据”回调在两次排空之间至多触发一次，
/// 因此多话的脚本不会用通知淹没宿主。
pub struct ConsoleBuffer {
    state: Mutex<ConsoleState>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConsoleState {
                bytes: Vec::new(),
                notified: false,
                observer: ConsoleObserver {
                    callback: None,
                    user_data: std::ptr::null_mut(),
                },
            }),
        }
    }

    pub fn set_observer(&self, callback: Option<ConsoleDataCallback>, user_data: *mut c_void) {
        let mut state = self.state.lock().unwrap();
        state.observer = ConsoleObserver { callback, user_data };
    }

    fn append(&self, write: impl FnOnce(&mut Vec<u8>)) {
        let mut state = self.state.lock().unwrap();
        write(&mut state.bytes);
        if !state.notified && !state.bytes.is_empty() {
            state.notified = true;
            let (callback, user_data) = (state.observer.callback, state.observer.user_data);
            drop(state);
            if let Some(callback) = callback {
                callback(user_data);
            }
        }
    }

    /// Begins an output line originating at `source`/`line`.
    pub fn begin_line(&self, source: u64, line: u32) {
        self.append(|bytes| {
            bytes.push(TAG_LINE_BEGIN);
            push_varuint(bytes, source);
            push_varuint(bytes, line as u64);
        });
    }

    /// ### English
    /// Appends one printed run to the open line. Empty runs are dropped;
    /// a zero length on the wire means end-of-line.
    ///
    /// ### 中文
    /// 向当前行追加一段打印数据。空数据段被丢弃——线上的零长度表示行结束。
    pub fn push_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.append(|bytes| {
            push_varuint(bytes, text.len() as u64);
            bytes.extend_from_slice(text.as_bytes());
        });
    }

    /// Ends the open line with a zero-length run.
    pub fn end_line(&self) {
        self.append(|bytes| push_varuint(bytes, 0));
    }

    /// Records a parsed script error.
    pub fn push_error(&self, file: &str, line: u32, message: &str) {
        self.append(|bytes| {
            bytes.push(TAG_ERROR);
            push_varuint(bytes, file.len() as u64);
            bytes.extend_from_slice(file.as_bytes());
            push_varuint(bytes, line as u64);
            push_varuint(bytes, message.len() as u64);
            bytes.extend_from_slice(message.as_bytes());
        });
    }

    /// ### English
    /// Drains the buffered records and re-arms the has-data latch.
    ///
    /// ### 中文
    /// 排空已缓冲的记录并重新武装“有数据”闩锁。
    pub fn take(&self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        state.notified = false;
        std::mem::take(&mut state.bytes)
    }

    pub fn byte_len(&self) -> usize {
        self.state.lock().unwrap().bytes.len()
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// ### English
/// Deadline handed to the engine's interrupt hook during one execution.
///
/// ### 中文
/// 单次执行期间交给引擎中断钩子的截止时间。
pub struct ScriptInterrupt {
    deadline: Instant,
}

impl ScriptInterrupt {
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
        }
    }

    pub fn should_interrupt(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// ### English
/// The narrow contract a script engine fulfills: execute one module, writing
/// output to the console and polling the interrupt from its safepoints.
///
/// ### 中文
/// 脚本引擎需满足的窄契约：执行一个模块，把输出写入控制台，并在安全点轮询中断。
pub trait ScriptEngine: Send {
    fn execute_module(
        &mut self,
        source: &str,
        console: &ConsoleBuffer,
        interrupt: &ScriptInterrupt,
    ) -> Result<(), EngineError>;
}

/// ### English
/// Owns one engine plus its console; applies the execution budget per run.
///
/// ### 中文
/// 持有一个引擎及其控制台；每次运行应用执行预算。
pub struct ScriptHost {
    engine: Box<dyn ScriptEngine>,
    console: ConsoleBuffer,
}

impl ScriptHost {
    pub fn new(engine: Box<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            console: ConsoleBuffer::new(),
        }
    }

    pub fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    pub fn execute_module(&mut self, source: &str) -> Result<(), EngineError> {
        let interrupt = ScriptInterrupt::with_budget(SCRIPT_EXECUTION_BUDGET);
        self.engine.execute_module(source, &self.console, &interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn line_records_use_the_tagged_varuint_layout() {
        let console = ConsoleBuffer::new();
        console.begin_line(0, 1);
        console.push_text("hi");
        console.push_text("");
        console.end_line();

        assert_eq!(console.take(), vec![0, 0, 1, 2, b'h', b'i', 0]);
    }

    #[test]
    fn long_runs_get_multi_byte_lengths() {
        let console = ConsoleBuffer::new();
        let text = "x".repeat(200);
        console.begin_line(0, 3);
        console.push_text(&text);

        let bytes = console.take();
        // tag, source, line, then 200 encoded as 0xC8 0x01.
        assert_eq!(&bytes[..5], &[0, 0, 3, 0xC8, 0x01]);
        assert_eq!(bytes.len(), 5 + 200);
    }

    #[test]
    fn error_records_carry_file_line_and_message() {
        let console = ConsoleBuffer::new();
        console.push_error("main", 7, "oops");

        let bytes = console.take();
        let mut expected = vec![1, 4];
        expected.extend_from_slice(b"main");
        expected.extend_from_slice(&[7, 4]);
        expected.extend_from_slice(b"oops");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn has_data_latch_fires_once_per_drain() {
        extern "C" fn bump(user_data: *mut c_void) {
            let counter = unsafe { &*(user_data as *const AtomicUsize) };
            counter.fetch_add(1, Ordering::SeqCst);
        }

        let console = ConsoleBuffer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        console.set_observer(Some(bump), Arc::as_ptr(&fired) as *mut c_void);

        console.begin_line(0, 1);
        console.push_text("a");
        console.push_text("b");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        console.take();
        console.begin_line(0, 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interrupt_trips_after_the_budget_elapses() {
        let interrupt = ScriptInterrupt::with_budget(Duration::ZERO);
        assert!(interrupt.should_interrupt());

        let generous = ScriptInterrupt::with_budget(Duration::from_secs(60));
        assert!(!generous.should_interrupt());
    }
}
