use std::rc::Rc;

use bitflags::bitflags;

/// Trap callback: `(addr, value, origin)`.
///
/// `addr` is the full bus address of the access, `value` the data unit read
/// or about to be written, and `origin` an opaque annotation supplied by the
/// caller of the access (typically the fetching PC), if any.
///
/// Hook identity is `Rc` pointer identity: installing the same `Rc` twice
/// bumps a reference count, installing a different one is rejected.
pub type TrapHook = Rc<dyn Fn(u32, u32, Option<u32>)>;

/// What backs a block of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockKind {
    /// Unpopulated. Reads return the all-ones sentinel, writes are dropped.
    None,
    Ram,
    /// Read-only once mapped; direct writes are silently dropped.
    Rom,
    /// RAM with display semantics; participates in dirty tracking like RAM.
    Video,
}

bitflags! {
    /// Kind mask for [`crate::Bus::enum_blocks`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockKinds: u8 {
        const RAM = 1 << 0;
        const ROM = 1 << 1;
        const VIDEO = 1 << 2;
    }
}

impl BlockKind {
    /// The mask bit for this kind; `None` blocks never match a mask.
    pub fn mask(self) -> BlockKinds {
        match self {
            BlockKind::None => BlockKinds::empty(),
            BlockKind::Ram => BlockKinds::RAM,
            BlockKind::Rom => BlockKinds::ROM,
            BlockKind::Video => BlockKinds::VIDEO,
        }
    }

    fn writable(self) -> bool {
        matches!(self, BlockKind::Ram | BlockKind::Video)
    }
}

pub(crate) struct Trap {
    pub(crate) hook: TrapHook,
    pub(crate) refs: u32,
}

/// Access handler state for one direction (read or write) of a block.
///
/// `Direct` is the untrapped fast path. A trap adds exactly one level of
/// indirection; stacking is expressed as a reference count on the single
/// installed hook, never as nested wrappers.
pub(crate) enum Handler {
    Direct,
    Trapped(Trap),
}

impl Handler {
    pub(crate) fn install(&mut self, hook: &TrapHook) -> bool {
        match self {
            Handler::Direct => {
                *self = Handler::Trapped(Trap {
                    hook: Rc::clone(hook),
                    refs: 1,
                });
                true
            }
            Handler::Trapped(trap) if Rc::ptr_eq(&trap.hook, hook) => {
                trap.refs += 1;
                true
            }
            Handler::Trapped(_) => false,
        }
    }

    pub(crate) fn remove(&mut self, hook: &TrapHook) -> bool {
        match self {
            Handler::Trapped(trap) if Rc::ptr_eq(&trap.hook, hook) => {
                trap.refs -= 1;
                if trap.refs == 0 {
                    *self = Handler::Direct;
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn hook(&self) -> Option<TrapHook> {
        match self {
            Handler::Direct => None,
            Handler::Trapped(trap) => Some(Rc::clone(&trap.hook)),
        }
    }
}

/// A uniformly sized, byte-addressable slice of the bus address space.
///
/// Blocks are allocated by the [`crate::Bus`] at construction and replaced by
/// `add_blocks`; they are never freed at runtime.
pub struct Block {
    addr: u32,
    kind: BlockKind,
    dirty: bool,
    /// Backing bytes; empty for `None` blocks.
    data: Box<[u8]>,
    pub(crate) read: Handler,
    pub(crate) write: Handler,
}

impl Block {
    pub(crate) fn new(addr: u32, size: u32, kind: BlockKind) -> Self {
        let data = if kind == BlockKind::None {
            Box::default()
        } else {
            vec![0u8; size as usize].into_boxed_slice()
        };
        Self {
            addr,
            kind,
            dirty: false,
            data,
            read: Handler::Direct,
            write: Handler::Direct,
        }
    }

    /// Base bus address of this block.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Size in bytes (the owning bus's block size, or 0 for the `None` pad).
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Whether the block has been written since the last `clean_blocks`.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clean(&mut self) {
        self.dirty = false;
    }

    /// Used by snapshot restore; normal writes set the flag themselves.
    pub(crate) fn set_dirty(&mut self) {
        self.dirty = true;
    }

    /// Raw byte read; `None`-block reads have no backing byte.
    pub(crate) fn read_byte(&self, offset: u32) -> Option<u8> {
        self.data.get(offset as usize).copied()
    }

    /// Raw byte write. Returns false when the write is dropped (`None`/ROM).
    pub(crate) fn write_byte(&mut self, offset: u32, value: u8) -> bool {
        if !self.kind.writable() {
            return false;
        }
        match self.data.get_mut(offset as usize) {
            Some(slot) => {
                *slot = value;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Bypasses the ROM write protection; used when mapping an image and when
    /// restoring a snapshot.
    pub(crate) fn load_byte(&mut self, offset: u32, value: u8) {
        if let Some(slot) = self.data.get_mut(offset as usize) {
            *slot = value;
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }
}
