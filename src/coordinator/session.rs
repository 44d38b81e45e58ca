use crate::pdp_assert;
use indexmap::IndexMap;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumCount as EnumCountMacro, EnumIter, IntoStaticStr};

/// Editor namespaces owned by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCountMacro, IntoStaticStr)]
pub enum Namespace {
    #[strum(serialize = "PromptDebugHighlight")]
    Highlight,
    #[strum(serialize = "PromptDebugPC")]
    ProgramCounter,
    #[strum(serialize = "PromptDebugRegister")]
    Register,
    #[strum(serialize = "PromptDebugPrompt")]
    PromptBuffer,
    #[strum(serialize = "PromptDebugConcealVar")]
    ConcealVar,
    #[strum(serialize = "PromptDebugConcealJump")]
    ConcealJump,
    #[strum(serialize = "PromptDebugBreakpoint")]
    Breakpoint,
}

impl Namespace {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Editor buffers owned by the session, found by name or created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCountMacro, IntoStaticStr)]
pub enum BufferSlot {
    #[strum(serialize = "Gdb capture")]
    Capture,
    #[strum(serialize = "Gdb disas")]
    Asm,
    #[strum(serialize = "Gdb prompt")]
    Prompt,
    #[strum(serialize = "Gdb i/o")]
    Io,
}

impl BufferSlot {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Slot whose buffer name is a suffix of `name`.
    pub fn matching(name: &str) -> Option<Self> {
        BufferSlot::iter().find(|slot| name.ends_with(slot.name()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JumpLocation {
    pub key: i64,
    pub file: String,
    pub lnum: i64,
}

/// Locations printed into the prompt buffer, keyed by prompt line.
#[derive(Debug, Default)]
pub struct JumpTable {
    jumps: Vec<JumpLocation>,
}

impl JumpTable {
    pub fn insert(&mut self, key: i64, file: &str, lnum: i64) {
        if let Some(last) = self.jumps.last() {
            pdp_assert!(last.key < key, "Jump {key} inserted after {}", last.key);
        }
        self.jumps.push(JumpLocation {
            key,
            file: file.to_string(),
            lnum,
        });
    }

    pub fn find(&self, key: i64) -> Option<&JumpLocation> {
        let idx = self.jumps.binary_search_by_key(&key, |j| j.key).ok()?;
        self.jumps.get(idx)
    }

    pub fn clear(&mut self) {
        self.jumps.clear();
    }

    pub fn len(&self) -> usize {
        self.jumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jumps.is_empty()
    }
}

/// State of the debugging session shared by all handlers.
#[derive(Debug)]
pub struct Session {
    pub selected_thread: i64,
    pub selected_frame: i64,
    pub is_stopped: bool,
    pub asm_mode: bool,
    /// Inferior pid, -1 while no inferior runs.
    pub pid: i64,
    pub source_bufnr: i64,
    /// Lines already written into the prompt buffer.
    pub num_lines_written: i64,
    exe_timestamp: Option<i64>,
    namespaces: [i64; Namespace::COUNT],
    buffers: [i64; BufferSlot::COUNT],
    /// Buffers the editor reported open, by absolute path.
    pub opened_buffers: IndexMap<String, i64>,
    pub jumps: JumpTable,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            selected_thread: 0,
            selected_frame: 0,
            is_stopped: true,
            asm_mode: false,
            pid: -1,
            source_bufnr: -1,
            num_lines_written: 0,
            exe_timestamp: None,
            namespaces: [-1; Namespace::COUNT],
            buffers: [-1; BufferSlot::COUNT],
            opened_buffers: IndexMap::new(),
            jumps: JumpTable::default(),
        }
    }
}

impl Session {
    pub fn namespace(&self, ns: Namespace) -> i64 {
        self.namespaces[ns as usize]
    }

    pub fn set_namespace(&mut self, ns: Namespace, id: i64) {
        self.namespaces[ns as usize] = id;
    }

    pub fn buffer(&self, slot: BufferSlot) -> i64 {
        self.buffers[slot as usize]
    }

    pub fn set_buffer(&mut self, slot: BufferSlot, bufnr: i64) {
        self.buffers[slot as usize] = bufnr;
    }

    pub fn has_exe_timestamp(&self) -> bool {
        self.exe_timestamp.is_some()
    }

    pub fn exe_timestamp(&self) -> Option<i64> {
        self.exe_timestamp
    }

    /// Executable modification time, may be set only once.
    pub fn set_exe_timestamp(&mut self, ts: i64) {
        pdp_assert!(!self.has_exe_timestamp(), "Executable timestamp is already set");
        self.exe_timestamp = Some(ts);
    }
}
