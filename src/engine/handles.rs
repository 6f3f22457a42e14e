//! ### English
//! Generation-checked handle arena.
//!
//! Scene objects cross the C ABI as opaque `u64` handles rather than raw
//! pointers. Each handle packs a slot index and a generation; releasing a
//! slot bumps its generation, so a stale handle held by the host after
//! release can never reach a recycled object.
//!
//! ### 中文
//! 带代际校验的句柄仓。
//!
//! 场景对象以不透明 `u64` 句柄而非裸指针跨越 C ABI。每个句柄打包槽位索引与
//! 代际；释放槽位会递增代际，因此宿主在释放后持有的过期句柄永远无法触达被复用
//! 的对象。

use std::sync::Mutex;

/// ### English
/// Packed handle: slot index in the high 32 bits, generation in the low 32.
/// `0` is never a valid handle (generations start at 1).
///
/// ### 中文
/// 打包句柄：高 32 位为槽位索引，低 32 位为代际。`0` 永远不是有效句柄
/// （代际从 1 开始）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawHandle(u64);

impl RawHandle {
    pub const INVALID: RawHandle = RawHandle(0);

    fn pack(index: u32, generation: u32) -> Self {
        Self(((index as u64) << 32) | generation as u64)
    }

    fn index(self) -> usize {
        (self.0 >> 32) as usize
    }

    fn generation(self) -> u32 {
        self.0 as u32
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

struct Entry<T> {
    value: Option<T>,
    generation: u32,
    refcount: u32,
}

/// ### English
/// Reference-counted arena addressed by [`RawHandle`]. All accesses verify
/// the generation; stale handles are silently rejected (`None`/`false`),
/// matching the boundary's no-op-on-misuse policy.
///
/// ### 中文
/// 以 [`RawHandle`] 寻址的引用计数仓。所有访问都校验代际；过期句柄被静默拒绝
/// （返回 `None`/`false`），与边界的“误用即无操作”策略一致。
pub struct HandleTable<T> {
    state: Mutex<TableState<T>>,
}

struct TableState<T> {
    entries: Vec<Entry<T>>,
    free: Vec<usize>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Inserts a value with a reference count of 1.
    pub fn insert(&self, value: T) -> RawHandle {
        let mut state = self.state.lock().unwrap();
        match state.free.pop() {
            Some(index) => {
                let entry = &mut state.entries[index];
                entry.value = Some(value);
                entry.refcount = 1;
                RawHandle::pack(index as u32, entry.generation)
            }
            None => {
                let index = state.entries.len();
                state.entries.push(Entry {
                    value: Some(value),
                    generation: 1,
                    refcount: 1,
                });
                RawHandle::pack(index as u32, 1)
            }
        }
    }

    fn live_entry<'a>(state: &'a mut TableState<T>, handle: RawHandle) -> Option<&'a mut Entry<T>> {
        let entry = state.entries.get_mut(handle.index())?;
        if entry.generation != handle.generation() || entry.value.is_none() {
            return None;
        }
        Some(entry)
    }

    /// Runs `f` over the value behind `handle`, if it is still live.
    pub fn with<R>(&self, handle: RawHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        let entry = Self::live_entry(&mut state, handle)?;
        Some(f(entry.value.as_mut().unwrap()))
    }

    /// Increments the reference count. Returns false for stale handles.
    pub fn retain(&self, handle: RawHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        match Self::live_entry(&mut state, handle) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// ### English
    /// Decrements the reference count; on reaching zero the value is removed,
    /// the generation is bumped, and the slot is recycled. Returns the value
    /// when this release was the last reference.
    ///
    /// ### 中文
    /// 递减引用计数；归零时移除值、递增代际并回收槽位。若本次释放是最后一个引用
    /// 则返回该值。
    pub fn release(&self, handle: RawHandle) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let entry = Self::live_entry(&mut state, handle)?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return None;
        }
        let value = entry.value.take();
        entry.generation = entry.generation.wrapping_add(1);
        let index = handle.index();
        state.free.push(index);
        value
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_release() {
        let table = HandleTable::new();
        let handle = table.insert("scene");
        assert_eq!(table.with(handle, |v| *v), Some("scene"));

        assert_eq!(table.release(handle), Some("scene"));
        assert_eq!(table.with(handle, |v| *v), None);
        assert!(!table.retain(handle));
    }

    #[test]
    fn recycled_slot_gets_a_new_generation() {
        let table = HandleTable::new();
        let first = table.insert(1);
        table.release(first);

        let second = table.insert(2);
        // Same slot, different generation: the old handle stays dead.
        assert_ne!(first.as_u64(), second.as_u64());
        assert_eq!(table.with(first, |v| *v), None);
        assert_eq!(table.with(second, |v| *v), Some(2));
    }

    #[test]
    fn retain_keeps_the_value_alive_across_one_release() {
        let table = HandleTable::new();
        let handle = table.insert(7);
        assert!(table.retain(handle));

        assert_eq!(table.release(handle), None);
        assert_eq!(table.with(handle, |v| *v), Some(7));
        assert_eq!(table.release(handle), Some(7));
        assert!(table.is_empty());
    }

    #[test]
    fn zero_is_never_a_valid_handle() {
        let table = HandleTable::<u32>::new();
        let _live = table.insert(9);
        assert_eq!(table.with(RawHandle::INVALID, |v| *v), None);
        assert_eq!(table.with(RawHandle::from_u64(0), |v| *v), None);
    }
}
