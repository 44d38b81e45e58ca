use crate::expr::{ExprKind, Node};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::fmt;

/// Parse a decimal integer with an optional leading minus.
fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    let (negative, digits) = match bytes.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, bytes),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let mut value: i64 = 0;
    for &d in digits {
        let digit = (d - b'0') as i64;
        value = value.checked_mul(10)?;
        // negatives accumulate downwards, `i64::MIN` has no positive counterpart
        value = if negative {
            value.checked_sub(digit)?
        } else {
            value.checked_add(digit)?
        };
    }
    Some(value)
}

macro_rules! common_view_impl {
    ($view: ident, $target: literal) => {
        impl<'t> $view<'t> {
            pub fn new(node: Option<Node<'t>>) -> Self {
                Self { node }
            }

            /// View that points to nothing.
            pub fn null() -> Self {
                Self { node: None }
            }

            pub fn node(&self) -> Option<Node<'t>> {
                self.node
            }

            /// `true` when the view points to a node (even a null one).
            pub fn is_some(&self) -> bool {
                self.node.is_some()
            }

            pub fn kind(&self) -> Option<ExprKind> {
                self.node.map(|n| n.kind())
            }

            /// Number of elements in a composite or length of a string.
            pub fn count(&self) -> usize {
                self.node.map(|n| n.size()).unwrap_or_default()
            }

            /// Member of a tuple or a map with string key.
            pub fn get(&self, key: &str) -> Self {
                let Some(node) = self.node else {
                    return Self::null();
                };
                match node.kind() {
                    ExprKind::Tuple | ExprKind::Map => Self::new(node.lookup(key.as_bytes())),
                    kind => {
                        log::warn!(target: $target, "lookup of \"{key}\" in {kind}");
                        Self::null()
                    }
                }
            }

            /// Element of a list.
            pub fn at(&self, index: usize) -> Self {
                let Some(node) = self.node else {
                    return Self::null();
                };
                if node.kind() != ExprKind::List {
                    log::warn!(target: $target, "index {index} of {}", node.kind());
                    return Self::null();
                }
                if index >= node.size() {
                    log::warn!(target: $target, "index {index} out of range ({})", node.size());
                    return Self::null();
                }
                Self::new(node.child(index))
            }

            /// Iterate over list elements.
            pub fn iter(&self) -> impl Iterator<Item = $view<'t>> + 't {
                let node = self.node.filter(|n| n.kind() == ExprKind::List);
                let len = node.map(|n| n.size()).unwrap_or_default();
                (0..len).map(move |i| $view::new(node.and_then(|n| n.child(i))))
            }

            pub fn as_bytes(&self) -> Option<&'t [u8]> {
                self.node.and_then(|n| n.as_bytes())
            }

            pub fn as_str(&self) -> Option<&'t str> {
                self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
            }

            pub fn str_or(&self, default: &'t str) -> &'t str {
                self.as_str().unwrap_or(default)
            }

            /// String content, an absent or non-string value logs a warning and reads as empty.
            pub fn require_str(&self) -> &'t str {
                match self.as_str() {
                    Some(s) => s,
                    None => {
                        log::warn!(target: $target, "string expected, got {:?}", self.kind());
                        ""
                    }
                }
            }

            pub fn number_or(&self, default: i64) -> i64 {
                self.as_int().unwrap_or(default)
            }

            /// Number content, an absent or non-numeric value logs a warning and reads as zero.
            pub fn require_int(&self) -> i64 {
                match self.as_int() {
                    Some(n) => n,
                    None => {
                        log::warn!(target: $target, "integer expected, got {:?}", self.kind());
                        0
                    }
                }
            }

            /// JSON form of the underlying node, for diagnostics.
            pub fn to_json(&self) -> String {
                serde_json::to_string(self).unwrap_or_else(|e| format!("<{e}>"))
            }
        }

        impl PartialEq<&str> for $view<'_> {
            fn eq(&self, other: &&str) -> bool {
                self.as_bytes() == Some(other.as_bytes())
            }
        }

        impl fmt::Display for $view<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.node {
                    Some(node) => write!(f, "{node}"),
                    None => f.write_str("<none>"),
                }
            }
        }

        impl fmt::Debug for $view<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl Serialize for $view<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                match self.node {
                    Some(node) => NodeJson(node).serialize(serializer),
                    None => serializer.serialize_unit(),
                }
            }
        }
    };
}

/// Loose view for GDB/MI trees, where every value arrives as a c-string.
#[derive(Clone, Copy)]
pub struct GdbExprView<'t> {
    node: Option<Node<'t>>,
}

common_view_impl!(GdbExprView, "parser");

impl<'t> GdbExprView<'t> {
    /// Integer value of an int node or of a decimal string.
    pub fn as_int(&self) -> Option<i64> {
        let node = self.node?;
        match node.kind() {
            ExprKind::Int => node.as_int(),
            ExprKind::String => node.as_bytes().and_then(parse_decimal),
            _ => None,
        }
    }

    /// Iterate over tuple results.
    pub fn results(&self) -> impl Iterator<Item = (&'t str, GdbExprView<'t>)> + 't {
        let node = self.node.filter(|n| n.kind() == ExprKind::Tuple);
        let len = node.map(|n| n.size()).unwrap_or_default();
        (0..len).filter_map(move |i| {
            let (key, value) = node?.tuple_entry(i)?;
            Some((std::str::from_utf8(key).ok()?, GdbExprView::new(Some(value))))
        })
    }
}

/// Strict view for msgpack trees, kinds must match exactly.
#[derive(Clone, Copy)]
pub struct RpcExprView<'t> {
    node: Option<Node<'t>>,
}

common_view_impl!(RpcExprView, "editor");

impl<'t> RpcExprView<'t> {
    pub fn as_int(&self) -> Option<i64> {
        self.node.and_then(|n| n.as_int())
    }

    /// Booleans are materialized as integers `0` and `1`.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_int().map(|v| v != 0)
    }

    pub fn is_nil(&self) -> bool {
        self.kind() == Some(ExprKind::Null)
    }

    /// Member of a map with integer key.
    pub fn get_int(&self, key: i64) -> Self {
        Self::new(self.node.and_then(|n| n.lookup_int(key)))
    }
}

struct NodeJson<'t>(Node<'t>);

impl Serialize for NodeJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let node = self.0;
        match node.kind() {
            ExprKind::Null => serializer.serialize_unit(),
            ExprKind::Int => serializer.serialize_i64(node.as_int().unwrap_or_default()),
            ExprKind::String => serializer
                .serialize_str(&String::from_utf8_lossy(node.as_bytes().unwrap_or_default())),
            ExprKind::List => {
                let mut seq = serializer.serialize_seq(Some(node.size()))?;
                for child in (0..node.size()).filter_map(|i| node.child(i)) {
                    seq.serialize_element(&NodeJson(child))?;
                }
                seq.end()
            }
            ExprKind::Tuple => {
                let mut map = serializer.serialize_map(Some(node.size()))?;
                for (key, value) in (0..node.size()).filter_map(|i| node.tuple_entry(i)) {
                    map.serialize_entry(&String::from_utf8_lossy(key), &NodeJson(value))?;
                }
                map.end()
            }
            ExprKind::Map => {
                let mut map = serializer.serialize_map(Some(node.size()))?;
                for (key, value) in (0..node.size()).filter_map(|i| node.map_entry(i)) {
                    map.serialize_entry(&NodeJson(key), &NodeJson(value))?;
                }
                map.end()
            }
        }
    }
}
