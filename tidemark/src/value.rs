//! Runtime value model
//!
//! Every datum the store can hold is a [`Value`]. Scalars are copied,
//! collections share their root node, so cloning is always cheap.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::tree::VersionedList;
use crate::tree::VersionedMap;

/// A value held by the store.
///
/// Collections are persistent: cloning a `List` or `Map` shares the
/// underlying tree, and mutating operations return new values.
#[derive(Clone, Debug)]
pub enum Value {
    /// The absent value.
    Nil,
    /// 32 bit signed integer.
    Int(i32),
    /// 64 bit signed integer.
    Long(i64),
    /// 32 bit IEEE float.
    Float(f32),
    /// 64 bit IEEE float.
    Double(f64),
    /// Immutable string.
    Str(Arc<str>),
    /// Versioned list.
    List(VersionedList),
    /// Versioned map.
    Map(VersionedMap),
}

/// The runtime kind of a [`Value`], used for codec dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Kind of [`Value::Nil`].
    Nil,
    /// Kind of [`Value::Int`].
    Int,
    /// Kind of [`Value::Long`].
    Long,
    /// Kind of [`Value::Float`].
    Float,
    /// Kind of [`Value::Double`].
    Double,
    /// Kind of [`Value::Str`].
    Str,
    /// Kind of [`Value::List`].
    List,
    /// Kind of [`Value::Map`].
    Map,
}

impl ValueKind {
    // Rank used to order values of different kinds.
    fn rank(&self) -> u8 {
        match self {
            ValueKind::Nil => 0,
            ValueKind::Int => 1,
            ValueKind::Long => 2,
            ValueKind::Float => 3,
            ValueKind::Double => 4,
            ValueKind::Str => 5,
            ValueKind::List => 6,
            ValueKind::Map => 7,
        }
    }
}

impl Value {
    /// Runtime kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Instance identity.
    ///
    /// Strings and collections compare by shared pointer, scalars by value.
    /// Two equal strings read from different places are *not* the same
    /// instance; a clone is.
    pub fn same_instance(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => a.same_root(b),
            (Value::Map(a), Value::Map(b)) => a.same_root(b),
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            // Bitwise-style comparison so that Eq/Ord stay lawful
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b) == Ordering::Equal,
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b) == Ordering::Equal,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            _ => self.kind().rank().cmp(&other.kind().rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::List(v) => write!(f, "list[{}]", v.total_size()),
            Value::Map(v) => write!(f, "map[{}]", v.total_size()),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v.as_str()))
    }
}

impl From<VersionedList> for Value {
    fn from(v: VersionedList) -> Self {
        Value::List(v)
    }
}

impl From<VersionedMap> for Value {
    fn from(v: VersionedMap) -> Self {
        Value::Map(v)
    }
}
