//! Cache key derivation.
//!
//! A key is `"<function id>:<digest>"`, where the digest is a truncated SHA-256
//! over a canonical JSON rendering of the call arguments. Keyword arguments and
//! the fields of every nested object are sorted by name before hashing, so the
//! order in which a caller supplies them never changes the key.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::CacheError;

/// Number of digest bytes kept in a key (rendered as 32 hex characters).
const DIGEST_BYTES: usize = 16;

/// Opaque, deterministic identifier of one (function, arguments) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-derived key, e.g. one read back from a remote store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The function identity part of the key.
    pub fn function_id(&self) -> &str {
        self.0.rsplit_once(':').map_or(self.0.as_str(), |(id, _)| id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Canonical call arguments: positional values in call order plus keyword
/// values keyed by name.
///
/// # Examples
///
/// ```
/// use flightcache_core::{Args, KeyCodec};
///
/// let a = Args::new().kwarg("a", &1).unwrap().kwarg("b", &2).unwrap();
/// let b = Args::new().kwarg("b", &2).unwrap().kwarg("a", &1).unwrap();
///
/// assert_eq!(
///     KeyCodec::derive("demo::f", &a).unwrap(),
///     KeyCodec::derive("demo::f", &b).unwrap(),
/// );
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Args {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, CacheError> {
        let index = self.positional.len();
        self.positional
            .push(encode(value, || format!("positional argument {}", index))?);
        Ok(self)
    }

    /// Sets a keyword argument, replacing any previous value under `name`.
    pub fn kwarg<T: Serialize + ?Sized>(
        mut self,
        name: &str,
        value: &T,
    ) -> Result<Self, CacheError> {
        let encoded = encode(value, || format!("argument `{}`", name))?;
        self.named.insert(name.to_string(), encoded);
        Ok(self)
    }

    /// Builds arguments from a single serializable value.
    ///
    /// Tuples and sequences become positional arguments, structs and maps
    /// become keyword arguments, `()` becomes an empty argument list and any
    /// other value is a single positional argument.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, CacheError> {
        let mut args = Self::new();
        match encode(value, || "arguments".to_string())? {
            Value::Null => {}
            Value::Array(items) => args.positional = items,
            Value::Object(fields) => args.named = fields.into_iter().collect(),
            other => args.positional.push(other),
        }
        Ok(args)
    }

    /// Drops the named keyword arguments.
    pub fn without<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for name in names {
            self.named.remove(name.as_ref());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }
}

/// Derives [`CacheKey`]s. Pure and deterministic.
pub struct KeyCodec;

impl KeyCodec {
    /// Derives the key for calling `function_id` with `args`.
    pub fn derive(function_id: &str, args: &Args) -> Result<CacheKey, CacheError> {
        let tree = serde_json::to_value(args).map_err(|e| CacheError::Encoding(e.to_string()))?;
        let canonical = serde_json::to_vec(&canonicalize(tree))
            .map_err(|e| CacheError::Encoding(e.to_string()))?;
        let digest = Sha256::digest(&canonical);

        Ok(CacheKey(format!(
            "{}:{}",
            function_id,
            hex::encode(&digest[..DIGEST_BYTES])
        )))
    }
}

/// Stable identity for a function, `module::name`.
pub fn function_id(module_path: &str, name: &str) -> String {
    format!("{}::{}", module_path, name)
}

// serde_json renders NaN and infinities as `null`, which would give `f(NaN)`,
// `f(inf)` and `f(None)` one key. Such values are rejected instead.
fn encode<T, F>(value: &T, what: F) -> Result<Value, CacheError>
where
    T: Serialize + ?Sized,
    F: FnOnce() -> String,
{
    value
        .serialize(finite::FiniteCheck)
        .map_err(|e| e.to_string())
        .and_then(|()| serde_json::to_value(value).map_err(|e| e.to_string()))
        .map_err(|e| CacheError::Encoding(format!("{}: {}", what(), e)))
}

/// A serializer that produces nothing and fails on non-finite floats.
mod finite {
    use std::fmt;

    use serde::ser::{self, Serialize};

    #[derive(Debug)]
    pub(super) struct NonFinite(String);

    impl fmt::Display for NonFinite {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl std::error::Error for NonFinite {}

    impl ser::Error for NonFinite {
        fn custom<T: fmt::Display>(msg: T) -> Self {
            NonFinite(msg.to_string())
        }
    }

    fn float(value: f64) -> Result<(), NonFinite> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(NonFinite(format!("non-finite float {} has no stable encoding", value)))
        }
    }

    pub(super) struct FiniteCheck;

    macro_rules! accept {
        ($($method:ident: $ty:ty),* $(,)?) => {
            $(
                fn $method(self, _: $ty) -> Result<(), NonFinite> {
                    Ok(())
                }
            )*
        };
    }

    impl ser::Serializer for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;
        type SerializeSeq = Self;
        type SerializeTuple = Self;
        type SerializeTupleStruct = Self;
        type SerializeTupleVariant = Self;
        type SerializeMap = Self;
        type SerializeStruct = Self;
        type SerializeStructVariant = Self;

        accept! {
            serialize_bool: bool,
            serialize_i8: i8,
            serialize_i16: i16,
            serialize_i32: i32,
            serialize_i64: i64,
            serialize_i128: i128,
            serialize_u8: u8,
            serialize_u16: u16,
            serialize_u32: u32,
            serialize_u64: u64,
            serialize_u128: u128,
            serialize_char: char,
            serialize_str: &str,
            serialize_bytes: &[u8],
            serialize_unit_struct: &'static str,
        }

        fn serialize_f32(self, v: f32) -> Result<(), NonFinite> {
            float(f64::from(v))
        }

        fn serialize_f64(self, v: f64) -> Result<(), NonFinite> {
            float(v)
        }

        fn serialize_none(self) -> Result<(), NonFinite> {
            Ok(())
        }

        fn serialize_some<T>(self, value: &T) -> Result<(), NonFinite>
        where
            T: Serialize + ?Sized,
        {
            value.serialize(self)
        }

        fn serialize_unit(self) -> Result<(), NonFinite> {
            Ok(())
        }

        fn serialize_unit_variant(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
        ) -> Result<(), NonFinite> {
            Ok(())
        }

        fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<(), NonFinite>
        where
            T: Serialize + ?Sized,
        {
            value.serialize(self)
        }

        fn serialize_newtype_variant<T>(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
            value: &T,
        ) -> Result<(), NonFinite>
        where
            T: Serialize + ?Sized,
        {
            value.serialize(self)
        }

        fn serialize_seq(self, _len: Option<usize>) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_tuple(self, _len: usize) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_tuple_variant(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_map(self, _len: Option<usize>) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_struct_variant(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> Result<Self, NonFinite> {
            Ok(self)
        }
    }

    impl ser::SerializeSeq for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }

    impl ser::SerializeTuple for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }

    impl ser::SerializeTupleStruct for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }

    impl ser::SerializeTupleVariant for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }

    impl ser::SerializeMap for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), NonFinite> {
            key.serialize(FiniteCheck)
        }

        fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }

    impl ser::SerializeStruct for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_field<T: Serialize + ?Sized>(
            &mut self,
            _key: &'static str,
            value: &T,
        ) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }

    impl ser::SerializeStructVariant for FiniteCheck {
        type Ok = ();
        type Error = NonFinite;

        fn serialize_field<T: Serialize + ?Sized>(
            &mut self,
            _key: &'static str,
            value: &T,
        ) -> Result<(), NonFinite> {
            value.serialize(FiniteCheck)
        }

        fn end(self) -> Result<(), NonFinite> {
            Ok(())
        }
    }
}

// serde_json keeps insertion order when `preserve_order` is enabled anywhere in
// the dependency graph, so objects are re-sorted explicitly.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sorted: Vec<(String, Value)> = fields.into_iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = Map::with_capacity(sorted.len());
            for (name, inner) in sorted {
                map.insert(name, canonicalize(inner));
            }
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Query {
        user: u64,
        verbose: bool,
    }

    #[test]
    fn test_same_arguments_same_key() {
        let a = Args::new().arg(&42).unwrap().arg("x").unwrap();
        let b = Args::new().arg(&42).unwrap().arg("x").unwrap();
        assert_eq!(
            KeyCodec::derive("m::f", &a).unwrap(),
            KeyCodec::derive("m::f", &b).unwrap()
        );
    }

    #[test]
    fn test_keyword_order_does_not_matter() {
        let a = Args::new().kwarg("a", &1).unwrap().kwarg("b", &2).unwrap();
        let b = Args::new().kwarg("b", &2).unwrap().kwarg("a", &1).unwrap();
        assert_eq!(
            KeyCodec::derive("m::f", &a).unwrap(),
            KeyCodec::derive("m::f", &b).unwrap()
        );
    }

    #[test]
    fn test_positional_order_matters() {
        let a = Args::new().arg(&1).unwrap().arg(&2).unwrap();
        let b = Args::new().arg(&2).unwrap().arg(&1).unwrap();
        assert_ne!(
            KeyCodec::derive("m::f", &a).unwrap(),
            KeyCodec::derive("m::f", &b).unwrap()
        );
    }

    #[test]
    fn test_function_identity_is_part_of_key() {
        let args = Args::new().arg(&1).unwrap();
        let f = KeyCodec::derive("m::f", &args).unwrap();
        let g = KeyCodec::derive("m::g", &args).unwrap();
        assert_ne!(f, g);
        assert_eq!(f.function_id(), "m::f");
        assert!(f.as_str().starts_with("m::f:"));
        assert_eq!(f.as_str().len(), "m::f:".len() + DIGEST_BYTES * 2);
    }

    #[test]
    fn test_positional_and_keyword_do_not_collide() {
        let positional = Args::new().arg(&1).unwrap();
        let keyword = Args::new().kwarg("0", &1).unwrap();
        assert_ne!(
            KeyCodec::derive("m::f", &positional).unwrap(),
            KeyCodec::derive("m::f", &keyword).unwrap()
        );
    }

    #[test]
    fn test_nested_maps_are_canonical() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for i in 0..32 {
            first.insert(format!("k{}", i), i);
        }
        for i in (0..32).rev() {
            second.insert(format!("k{}", i), i);
        }
        let a = Args::new().arg(&first).unwrap();
        let b = Args::new().arg(&second).unwrap();
        assert_eq!(
            KeyCodec::derive("m::f", &a).unwrap(),
            KeyCodec::derive("m::f", &b).unwrap()
        );
    }

    #[test]
    fn test_non_string_map_keys_fail_to_encode() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        let err = Args::new().kwarg("lookup", &map).unwrap_err();
        assert!(matches!(err, CacheError::Encoding(_)));
        assert!(err.to_string().contains("argument `lookup`"));
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        for x in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let err = Args::from_value(&(x,)).unwrap_err();
            assert!(matches!(err, CacheError::Encoding(_)));
            assert!(Args::new().kwarg("x", &Some(x)).is_err());
        }
        assert!(Args::new().arg(&vec![1.5f32, f32::NAN]).is_err());

        // `None` still encodes, and finite floats keep distinct keys
        let none = KeyCodec::derive("m::f", &Args::from_value(&(None::<f64>,)).unwrap()).unwrap();
        let zero = KeyCodec::derive("m::f", &Args::from_value(&(0.0f64,)).unwrap()).unwrap();
        let max = KeyCodec::derive("m::f", &Args::from_value(&(f64::MAX,)).unwrap()).unwrap();
        assert_ne!(none, zero);
        assert_ne!(zero, max);
    }

    #[test]
    fn test_from_value_shapes() {
        let tuple = Args::from_value(&(1, "a")).unwrap();
        assert_eq!(tuple.positional().len(), 2);

        let record = Args::from_value(&Query {
            user: 7,
            verbose: true,
        })
        .unwrap();
        assert_eq!(record.named().len(), 2);
        assert!(record.positional().is_empty());

        assert!(Args::from_value(&()).unwrap().is_empty());
        assert_eq!(Args::from_value(&5u8).unwrap().positional().len(), 1);
    }

    #[test]
    fn test_without_drops_ignored_fields() {
        let args = Args::from_value(&Query {
            user: 7,
            verbose: true,
        })
        .unwrap()
        .without(&["verbose"]);
        let plain = Args::new().kwarg("user", &7u64).unwrap();
        assert_eq!(
            KeyCodec::derive("m::f", &args).unwrap(),
            KeyCodec::derive("m::f", &plain).unwrap()
        );
    }

    #[test]
    fn test_function_id_helper() {
        assert_eq!(function_id("crate::users", "load"), "crate::users::load");
    }
}
