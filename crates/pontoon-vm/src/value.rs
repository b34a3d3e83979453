//! Guest values
//!
//! Heap-allocated variants are behind `Rc`; the engine is single-threaded
//! by contract, so no locking is involved. Identity of object-shaped
//! values is `Rc` pointer identity.

use std::cell::RefCell;
use std::rc::Rc;

use crate::object::GuestObject;

/// A unique symbol value. Identity is the `Rc` allocation; the
/// description is purely informational.
#[derive(Debug)]
pub struct SymbolData {
    /// Optional description, preserved across the bridge
    pub description: Option<String>,
}

/// A guest value as stored in the heap.
#[derive(Clone)]
pub enum GuestValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Symbol(Rc<SymbolData>),
    /// Objects, arrays, functions, promises, errors and proxies all share
    /// the object representation; see [`crate::object::ObjectKind`].
    Object(Rc<RefCell<GuestObject>>),
}

impl GuestValue {
    /// `typeof`-style tag for this value
    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Object(o) => {
                if o.borrow().is_callable() {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    /// Strict identity: primitives by value, heap values by pointer.
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Truthiness, used by the evaluator
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::Symbol(_) | Self::Object(_) => true,
        }
    }

    /// The object payload, if this is object-shaped
    pub fn as_object(&self) -> Option<&Rc<RefCell<GuestObject>>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Stable address of the heap allocation for object-shaped values.
    /// Returns `None` for primitives, which have no identity.
    pub fn heap_addr(&self) -> Option<usize> {
        match self {
            Self::Object(o) => Some(Rc::as_ptr(o) as usize),
            Self::Symbol(s) => Some(Rc::as_ptr(s) as usize),
            _ => None,
        }
    }

    /// Best-effort display used in error messages
    pub fn render(&self) -> String {
        match self {
            Self::Undefined => "undefined".into(),
            Self::Null => "null".into(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.to_string(),
            Self::Symbol(s) => match &s.description {
                Some(d) => format!("Symbol({d})"),
                None => "Symbol()".into(),
            },
            Self::Object(o) => o.borrow().render(),
        }
    }
}

impl std::fmt::Debug for GuestValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Format a number the way scripts expect (`1` rather than `1.0`)
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::GuestObject;

    #[test]
    fn test_same_value_primitives() {
        assert!(GuestValue::Number(1.0).same_value(&GuestValue::Number(1.0)));
        assert!(GuestValue::Number(f64::NAN).same_value(&GuestValue::Number(f64::NAN)));
        assert!(!GuestValue::Number(1.0).same_value(&GuestValue::Number(2.0)));
        assert!(GuestValue::Null.same_value(&GuestValue::Null));
        assert!(!GuestValue::Null.same_value(&GuestValue::Undefined));
    }

    #[test]
    fn test_same_value_objects_by_identity() {
        let a = Rc::new(RefCell::new(GuestObject::plain()));
        let v1 = GuestValue::Object(a.clone());
        let v2 = GuestValue::Object(a);
        let v3 = GuestValue::Object(Rc::new(RefCell::new(GuestObject::plain())));
        assert!(v1.same_value(&v2));
        assert!(!v1.same_value(&v3));
    }

    #[test]
    fn test_type_of() {
        assert_eq!(GuestValue::Undefined.type_of(), "undefined");
        assert_eq!(GuestValue::Null.type_of(), "object");
        assert_eq!(GuestValue::Number(1.0).type_of(), "number");
    }
}
