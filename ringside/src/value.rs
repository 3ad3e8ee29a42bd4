use std::{any::Any, fmt, sync::Arc};

use zbus::zvariant;

/// A schema-free attribute value carried by an [`Event`](crate::Event).
///
/// Bus arguments are unwrapped into these host-native values before an event
/// is built, so patterns can compare them without knowing the wire type.
/// Variants are nested freely (`List` of `Dict` of ...).
///
/// Signed and unsigned integers compare numerically, so a pattern written
/// with `2` matches a bus `uint32` of 2. Object paths compare equal to
/// strings with the same text.
///
/// # Example
///
/// ```rust
/// use ringside::Value;
///
/// let args = Value::from(vec![Value::from("Powered"), Value::from(true)]);
/// assert!(args.contains(&Value::from("Powered")));
/// assert_eq!(Value::from(2), Value::from(2u32));
/// ```
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Handle(Handle),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// The host object behind a `Handle` value, if it is a `T`.
    pub fn downcast_handle<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.as_handle().and_then(Handle::downcast::<T>)
    }

    /// Looks up `key` in a `Dict` value.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Membership test: list element, dict key, or substring of a string.
    pub fn contains(&self, needle: &Value) -> bool {
        match (self, needle) {
            (Value::List(items), _) => items.iter().any(|item| item == needle),
            (Value::Dict(entries), _) => entries.iter().any(|(k, _)| k == needle),
            (Value::Str(haystack), Value::Str(n)) => haystack.contains(n.as_str()),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(i), Self::UInt(u)) | (Self::UInt(u), Self::Int(i)) => {
                u64::try_from(*i).is_ok_and(|i| i == *u)
            }
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::ObjectPath(a), Self::ObjectPath(b)) => a == b,
            (Self::Str(s), Self::ObjectPath(p)) | (Self::ObjectPath(p), Self::Str(s)) => s == p,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Handle(a), Self::Handle(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Str(s) => write!(f, "'{s}'"),
            Value::ObjectPath(p) => f.write_str(p),
            Value::Bytes(b) => write!(f, "b'{}'", String::from_utf8_lossy(b)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Handle(h) => write!(f, "{h:?}"),
        }
    }
}

macro_rules! from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v.into())
            }
        }
    )*};
}

macro_rules! from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::UInt(v.into())
            }
        }
    )*};
}

from_signed!(i16, i32, i64);
from_unsigned!(u8, u16, u32, u64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Str(v.clone())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Handle> for Value {
    fn from(v: Handle) -> Self {
        Value::Handle(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<&zvariant::Value<'_>> for Value {
    fn from(v: &zvariant::Value<'_>) -> Self {
        use zvariant::Value as Z;

        match v {
            Z::U8(b) => Value::UInt((*b).into()),
            Z::Bool(b) => Value::Bool(*b),
            Z::I16(i) => Value::Int((*i).into()),
            Z::U16(u) => Value::UInt((*u).into()),
            Z::I32(i) => Value::Int((*i).into()),
            Z::U32(u) => Value::UInt((*u).into()),
            Z::I64(i) => Value::Int(*i),
            Z::U64(u) => Value::UInt(*u),
            Z::F64(d) => Value::Double(*d),
            Z::Str(s) => Value::Str(s.as_str().to_owned()),
            Z::Signature(s) => Value::Str(s.to_string()),
            Z::ObjectPath(p) => Value::ObjectPath(p.as_str().to_owned()),
            // Variants are unwrapped to their content.
            Z::Value(inner) => Value::from(&**inner),
            Z::Array(array) => {
                if array.element_signature().to_string() == "y" {
                    Value::Bytes(
                        array
                            .iter()
                            .filter_map(|item| match item {
                                Z::U8(b) => Some(*b),
                                _ => None,
                            })
                            .collect(),
                    )
                } else {
                    Value::List(array.iter().map(Value::from).collect())
                }
            }
            Z::Dict(dict) => Value::Dict(
                dict.iter()
                    .map(|(k, v)| (Value::from(k), Value::from(v)))
                    .collect(),
            ),
            Z::Structure(s) => Value::List(s.fields().iter().map(Value::from).collect()),
            other => Value::Str(format!("{other:?}")),
        }
    }
}

/// Decodes the positional arguments of a bus message into host values.
pub(crate) fn body_args(message: &zbus::Message) -> zbus::Result<Vec<Value>> {
    let body = message.body();
    if body.signature().to_string().is_empty() {
        return Ok(Vec::new());
    }
    let fields: zvariant::Structure<'_> = body.deserialize()?;
    Ok(fields.fields().iter().map(Value::from).collect())
}

/// Opaque shared reference to a host object carried inside an event.
///
/// Equality is identity: two handles are equal only when they point at the
/// same allocation.
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Handle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Returns the referenced object if it is a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
