//! Breakpoints as reported by GDB, with the editor marks that show them.
//!
//! A breakpoint with several locations arrives as one parent record plus one record per
//! location (`1.1`, `1.2`, ...). The locations are stored as regular entries and the parent
//! keeps the list of its aliases.

use crate::expr::view::GdbExprView;
use crate::io::descriptor::real_path;
use crate::pdp_assert;
use crate::system::no_suspend::NoSuspendGuard;
use indexmap::IndexMap;
use strum_macros::Display;

const WATCH_BIT: u8 = 4;
const WATCH_READ_BIT: u8 = 1;
const WATCH_WRITE_BIT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[repr(u8)]
pub enum BreakpointType {
    #[default]
    Unknown = 0,
    Watch = WATCH_BIT | WATCH_WRITE_BIT,
    WatchRead = WATCH_BIT | WATCH_READ_BIT,
    WatchAcc = WATCH_BIT | WATCH_READ_BIT | WATCH_WRITE_BIT,
    Break = 8,
    Catch = 16,
}

impl BreakpointType {
    pub fn from_mi(kind: &str) -> Self {
        if kind == "breakpoint" {
            BreakpointType::Break
        } else if kind.ends_with("watchpoint") {
            if kind.starts_with("acc") {
                BreakpointType::WatchAcc
            } else if kind.starts_with("read") {
                BreakpointType::WatchRead
            } else {
                BreakpointType::Watch
            }
        } else if kind == "catchpoint" {
            BreakpointType::Catch
        } else {
            BreakpointType::Unknown
        }
    }

    pub fn is_watchpoint(self) -> bool {
        self as u8 & WATCH_BIT != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    /// Canonical path of the source file, empty when unknown.
    pub fullname: String,
    pub script: Option<String>,
    pub kind: BreakpointType,
    pub enabled: bool,
    /// 1-based line, -1 when unknown.
    pub lnum: i64,
    /// Editor mark id, 0 while no mark is placed.
    pub extmark: i64,
}

impl Default for Breakpoint {
    fn default() -> Self {
        Self {
            fullname: String::new(),
            script: None,
            kind: BreakpointType::Unknown,
            enabled: false,
            lnum: -1,
            extmark: 0,
        }
    }
}

impl Breakpoint {
    pub fn is_placed(&self) -> bool {
        self.extmark > 0
    }
}

#[derive(Default)]
pub struct BreakpointTable {
    canonical: IndexMap<String, Breakpoint>,
    aliases: IndexMap<String, Vec<String>>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a breakpoint. With a `parent` the record is a location of a
    /// multi-location breakpoint. Returns the id and whether it was not known before.
    pub fn insert(&mut self, bkpt: GdbExprView, parent: Option<GdbExprView>) -> (String, bool) {
        let id = bkpt.get("number").require_str().to_string();
        let is_new = !self.canonical.contains_key(&id);
        let entry = self.canonical.entry(id.clone()).or_default();

        entry.enabled = bkpt.get("enabled") == "y";
        let fullname = bkpt.get("fullname");
        if fullname.is_some() {
            entry.lnum = bkpt.get("line").require_int();
            entry.fullname = real_path(fullname.require_str()).unwrap_or_default();
        }
        // locations of a multi-location breakpoint carry no type of their own
        let kind = bkpt
            .get("type")
            .as_str()
            .or_else(|| parent.and_then(|p| p.get("type").as_str()));
        entry.kind = kind.map_or(BreakpointType::Unknown, BreakpointType::from_mi);
        let script = bkpt.get("script");
        if script.is_some() {
            entry.script = Some(script_text(script));
        }

        if let Some(parent) = parent {
            let parent_id = parent.get("number").require_str();
            entry.enabled = entry.enabled && parent.get("enabled") == "y";
            if parent_id != id {
                let aliases = self.aliases.entry(parent_id.to_string()).or_default();
                if !aliases.contains(&id) {
                    aliases.push(id.clone());
                }
            }
        }
        (id, is_new)
    }

    /// Remove a breakpoint together with all of its locations.
    pub fn delete(&mut self, id: &str) {
        match self.aliases.shift_remove(id) {
            Some(aliases) => {
                for alias in aliases {
                    let removed = self.canonical.shift_remove(&alias);
                    pdp_assert!(removed.is_some(), "Alias {alias} of {id} is not in the table");
                }
                self.canonical.shift_remove(id);
            }
            None => {
                self.canonical.shift_remove(id);
            }
        }
    }

    /// Locations of `id`: its aliases, the breakpoint itself or nothing.
    pub fn aliases(&self, id: &str) -> Aliases<'_> {
        let ids = match self.aliases.get(id) {
            Some(aliases) => aliases.as_slice(),
            None => match self.canonical.get_key_value(id) {
                Some((key, _)) => std::slice::from_ref(key),
                None => &[],
            },
        };
        Aliases {
            table: &self.canonical,
            ids: ids.iter(),
            _guard: NoSuspendGuard::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Breakpoint> {
        self.canonical.get(id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Breakpoint> {
        self.canonical.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    /// Every entry in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.canonical.iter(),
            _guard: NoSuspendGuard::new(),
        }
    }
}

/// Script commands come either as a single string or as a list of strings.
fn script_text(script: GdbExprView) -> String {
    match script.as_str() {
        Some(s) => s.to_string(),
        None => script
            .iter()
            .filter_map(|line| line.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Iterator over breakpoint locations, suspending is forbidden while it is alive.
pub struct Aliases<'a> {
    table: &'a IndexMap<String, Breakpoint>,
    ids: std::slice::Iter<'a, String>,
    _guard: NoSuspendGuard,
}

impl<'a> Iterator for Aliases<'a> {
    type Item = (&'a str, &'a Breakpoint);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        match self.table.get_key_value(id.as_str()) {
            Some((id, bkpt)) => Some((id.as_str(), bkpt)),
            None => crate::fatal!("Alias {id} is not in the table"),
        }
    }
}

pub struct Iter<'a> {
    inner: indexmap::map::Iter<'a, String, Breakpoint>,
    _guard: NoSuspendGuard,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a Breakpoint);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(id, bkpt)| (id.as_str(), bkpt))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::mi::parse_mi;
    use crate::system::no_suspend;

    fn insert(table: &mut BreakpointTable, record: &str) -> (String, bool) {
        let tree = parse_mi(record.as_bytes()).unwrap();
        let bkpt = tree.gdb_view().get("bkpt");
        table.insert(bkpt, None)
    }

    #[test]
    fn test_breakpoint_types() {
        struct TestCase {
            mi_type: &'static str,
            expected: BreakpointType,
        }
        let test_cases = [
            TestCase {
                mi_type: "breakpoint",
                expected: BreakpointType::Break,
            },
            TestCase {
                mi_type: "hw watchpoint",
                expected: BreakpointType::Watch,
            },
            TestCase {
                mi_type: "read watchpoint",
                expected: BreakpointType::WatchRead,
            },
            TestCase {
                mi_type: "acc watchpoint",
                expected: BreakpointType::WatchAcc,
            },
            TestCase {
                mi_type: "catchpoint",
                expected: BreakpointType::Catch,
            },
            TestCase {
                mi_type: "dprintf",
                expected: BreakpointType::Unknown,
            },
            TestCase {
                mi_type: "breakpoints",
                expected: BreakpointType::Unknown,
            },
        ];

        for tc in test_cases {
            assert_eq!(BreakpointType::from_mi(tc.mi_type), tc.expected, "{}", tc.mi_type);
        }
        assert_eq!(BreakpointType::Watch as u8, 6);
        assert_eq!(BreakpointType::WatchRead as u8, 5);
        assert_eq!(BreakpointType::WatchAcc as u8, 7);
        assert!(BreakpointType::WatchAcc.is_watchpoint());
        assert!(!BreakpointType::Break.is_watchpoint());
    }

    #[test]
    fn test_insert_and_update() {
        let mut table = BreakpointTable::new();
        let (id, is_new) = insert(
            &mut table,
            r#"bkpt={number="1",type="breakpoint",enabled="y",fullname="/",line="12",script=["silent","bt"]}"#,
        );
        assert_eq!(id, "1");
        assert!(is_new);

        let bkpt = table.find("1").unwrap();
        assert_eq!(bkpt.kind, BreakpointType::Break);
        assert!(bkpt.enabled);
        assert_eq!(bkpt.lnum, 12);
        assert_eq!(bkpt.fullname, "/");
        assert_eq!(bkpt.script.as_deref(), Some("silent\nbt"));
        assert!(!bkpt.is_placed());

        table.find_mut("1").unwrap().extmark = 3;
        let (_, is_new) = insert(
            &mut table,
            r#"bkpt={number="1",type="breakpoint",enabled="n",fullname="/",line="12"}"#,
        );
        assert!(!is_new);
        let bkpt = table.find("1").unwrap();
        assert!(!bkpt.enabled);
        assert_eq!(bkpt.extmark, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_pending_breakpoint() {
        let mut table = BreakpointTable::new();
        insert(
            &mut table,
            r#"bkpt={number="2",type="breakpoint",enabled="y",pending="nosuch.c:3"}"#,
        );
        let bkpt = table.find("2").unwrap();
        assert_eq!(bkpt.lnum, -1);
        assert!(bkpt.fullname.is_empty());
        assert!(bkpt.script.is_none());
    }

    #[test]
    fn test_aliases() {
        let record = r#"bkpt={number="3",type="breakpoint",enabled="n",locations=[{number="3.1",enabled="y",fullname="/",line="4"},{number="3.2",enabled="y",fullname="/",line="9"}]}"#;
        let tree = parse_mi(record.as_bytes()).unwrap();
        let parent = tree.gdb_view().get("bkpt");

        let mut table = BreakpointTable::new();
        table.insert(parent, None);
        for location in parent.get("locations").iter() {
            let (_, is_new) = table.insert(location, Some(parent));
            assert!(is_new);
        }
        // repeated modification does not duplicate aliases
        let first = parent.get("locations").at(0);
        table.insert(first, Some(parent));

        let aliases: Vec<_> = table.aliases("3").map(|(id, b)| (id.to_string(), b.lnum)).collect();
        assert_eq!(aliases, vec![("3.1".to_string(), 4), ("3.2".to_string(), 9)]);
        // disabled parent disables every location
        assert!(table.aliases("3").all(|(_, b)| !b.enabled));
        assert!(table.aliases("3").all(|(_, b)| b.kind == BreakpointType::Break));

        let single: Vec<_> = table.aliases("3.2").map(|(id, _)| id.to_string()).collect();
        assert_eq!(single, vec!["3.2"]);
        assert_eq!(table.aliases("7").count(), 0);

        table.delete("3");
        assert!(table.is_empty());
        assert_eq!(table.aliases("3").count(), 0);
    }

    #[test]
    fn test_delete_single() {
        let mut table = BreakpointTable::new();
        insert(&mut table, r#"bkpt={number="1",type="breakpoint",enabled="y"}"#);
        insert(&mut table, r#"bkpt={number="2",type="catchpoint",enabled="y"}"#);
        table.delete("1");
        table.delete("42");
        let ids: Vec<_> = table.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[test]
    fn test_iteration_forbids_suspend() {
        let mut table = BreakpointTable::new();
        insert(&mut table, r#"bkpt={number="1",type="breakpoint",enabled="y"}"#);
        {
            let aliases = table.aliases("1");
            assert_eq!(no_suspend::depth(), 1);
            drop(aliases);
        }
        let iter = table.iter();
        assert_eq!(no_suspend::depth(), 1);
        drop(iter);
        assert_eq!(no_suspend::depth(), 0);
    }
}
