//! The dynamically typed value layer.
//!
//! Out of scope beyond what channel rendezvous needs to carry a payload:
//! this module only implements the tagged sum, copy, and comparison -- no
//! arithmetic, no string/tuple primitive operations. A real upstream
//! compiler would bring its own, richer value representation; the runtime
//! only needs to be able to move one opaquely enough to detect embedded
//! channel names for the refcount walk in [`crate::knowns`].
//!
//! Maps onto the original source's tagged `PIT_Value` (see
//! `original_source/include/pi_thread.h`): a closed sum with an exhaustive
//! match rather than a header+vtable dynamic dispatch scheme -- an enum is
//! the idiomatic Rust rendering of the same closed-tag design.

use std::sync::Arc;

use crate::channel::Channel;

/// A dynamically typed value passed between pi-threads.
#[derive(Clone)]
pub enum Value {
    /// The absence of a value (default env slot contents).
    NoValue,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Heap-managed string. `Arc` gives us copy-by-increment for free.
    Str(Arc<str>),
    /// Heap-managed tuple. Copy is a shallow `Arc` clone of the elements;
    /// cloning the `Vec` contents clones each `Value`, which for a nested
    /// `Channel` recursively bumps that channel's reference count per the
    /// ordinary `Clone` impl below -- no separate "deep copy" routine is
    /// needed.
    Tuple(Arc<Vec<Value>>),
    /// A non-owning name for a live channel. Keeping it alive is entirely
    /// the job of [`crate::knowns::KnownSet`] walking env deltas at step
    /// end -- a `Value::Channel` by itself does not bump `global_rc` on
    /// construction or clone.
    Channel(Arc<Channel>),
}

impl Value {
    /// Structural equality, used by tests and by `eval_func` callbacks that
    /// compare received values. Not total: comparing a `Tuple` containing a
    /// `Channel` against another compares channel identity (pointer
    /// equality), never structural deep-equality of the channel itself.
    pub fn struct_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::NoValue, Value::NoValue) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.struct_eq(y))
            }
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Walk this value (and, recursively, any tuple it contains) collecting
    /// every channel it names. Used by [`crate::knowns::KnownSet`] to learn
    /// which channels a freshly received value introduces.
    pub fn channels_named<'a>(&'a self, out: &mut Vec<&'a Arc<Channel>>) {
        match self {
            Value::Channel(c) => out.push(c),
            Value::Tuple(elems) => {
                for e in elems.iter() {
                    e.channels_named(out);
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::NoValue => write!(f, "<novalue>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Tuple(elems) => {
                write!(f, "(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e:?}")?;
                }
                write!(f, ")")
            }
            Value::Channel(c) => write!(f, "#Channel<{}>", c.id()),
        }
    }
}
