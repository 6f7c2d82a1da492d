//! Typed arguments carried inside a transfer payload.
//!
//! Arguments are `(name, typed value)` pairs. Integrated addresses embed them,
//! transfers carry them to the recipient and contract invocations use them for
//! the action, contract id, entrypoint and parameters. The packed form is the
//! byte string whose length is checked against `PAYLOAD0_LIMIT`:
//!
//! ```text
//! per argument, sorted by name:
//!   u8 name_len | name | u8 type_tag | value
//! value:
//!   String  -> varint len | bytes
//!   Int64   -> zigzag varint
//!   Uint64  -> varint
//!   Hash    -> 32 bytes
//!   Address -> 33 bytes (network tag | public key)
//!   Time    -> varint unix seconds
//! ```

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::Hash;

/// Service port the transfer is routed to on the recipient side.
pub const DESTINATION_PORT: &str = "D";
/// Service port on the sender side.
pub const SOURCE_PORT: &str = "S";
/// Amount locked by an integrated address.
pub const VALUE_TRANSFER: &str = "V";
/// Free-text comment.
pub const COMMENT: &str = "C";
/// Expiry time after which an integrated address must not be paid.
pub const EXPIRY: &str = "E";
/// Sender address attached for the recipient to reply to.
pub const REPLYBACK_ADDRESS: &str = "R";
/// Recipient asks for the sender's address.
pub const NEEDS_REPLYBACK_ADDRESS: &str = "N";

/// Contract action (`0` call, `1` install).
pub const SC_ACTION: &str = "SC_ACTION";
pub const SC_ID: &str = "SC_ID";
pub const SC_CODE: &str = "SC_CODE";
pub const SC_ENTRYPOINT: &str = "entrypoint";

pub const SC_ACTION_CALL: u64 = 0;
pub const SC_ACTION_INSTALL: u64 = 1;

/// Errors from argument validation and packing.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ArgsError {
    #[error("duplicate argument: {0}")]
    Duplicate(String),
    #[error("argument name must not be empty")]
    EmptyName,
    #[error("argument name too long: {0}")]
    NameTooLong(String),
    #[error("malformed packed arguments: {0}")]
    Malformed(String),
    #[error("arguments pack to {size} bytes, limit is {limit}")]
    Oversize { size: usize, limit: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Int64,
    Uint64,
    Hash,
    Address,
    Time,
}

impl DataType {
    fn tag(self) -> u8 {
        match self {
            DataType::String => b'S',
            DataType::Int64 => b'I',
            DataType::Uint64 => b'U',
            DataType::Hash => b'H',
            DataType::Address => b'A',
            DataType::Time => b'T',
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            b'S' => DataType::String,
            b'I' => DataType::Int64,
            b'U' => DataType::Uint64,
            b'H' => DataType::Hash,
            b'A' => DataType::Address,
            b'T' => DataType::Time,
            _ => return None,
        })
    }

    /// One-letter code used by the daemon's JSON-RPC.
    pub fn code(self) -> &'static str {
        match self {
            DataType::String => "S",
            DataType::Int64 => "I",
            DataType::Uint64 => "U",
            DataType::Hash => "H",
            DataType::Address => "A",
            DataType::Time => "T",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgValue {
    String(String),
    Int64(i64),
    Uint64(u64),
    Hash(Hash),
    Address(Address),
    Time(u64),
}

impl ArgValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ArgValue::String(_) => DataType::String,
            ArgValue::Int64(_) => DataType::Int64,
            ArgValue::Uint64(_) => DataType::Uint64,
            ArgValue::Hash(_) => DataType::Hash,
            ArgValue::Address(_) => DataType::Address,
            ArgValue::Time(_) => DataType::Time,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            ArgValue::String(s) => serde_json::Value::from(s.clone()),
            ArgValue::Int64(v) => serde_json::Value::from(*v),
            ArgValue::Uint64(v) => serde_json::Value::from(*v),
            ArgValue::Hash(h) => serde_json::Value::from(hex::encode(h)),
            ArgValue::Address(a) => serde_json::Value::from(a.to_string()),
            ArgValue::Time(t) => serde_json::Value::from(*t),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: ArgValue) -> Self {
        Argument {
            name: name.into(),
            value,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ArgValue::String(value.into()))
    }

    pub fn uint64(name: impl Into<String>, value: u64) -> Self {
        Self::new(name, ArgValue::Uint64(value))
    }

    /// `{"name": .., "datatype": .., "value": ..}` as the daemon expects it.
    pub fn to_rpc(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "datatype": self.value.data_type().code(),
            "value": self.value.to_json(),
        })
    }
}

/// An ordered set of uniquely named arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    pub fn new() -> Self {
        Arguments(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.0.iter()
    }

    /// True if an argument with this name and type is present.
    pub fn has(&self, name: &str, data_type: DataType) -> bool {
        self.get(name)
            .map(|v| v.data_type() == data_type)
            .unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    pub fn uint64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            ArgValue::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn address(&self, name: &str) -> Option<&Address> {
        match self.get(name)? {
            ArgValue::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn time(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            ArgValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn hash(&self, name: &str) -> Option<Hash> {
        match self.get(name)? {
            ArgValue::Hash(h) => Some(*h),
            _ => None,
        }
    }

    /// Insert or replace the argument with the same name.
    pub fn set(&mut self, arg: Argument) {
        match self.0.iter_mut().find(|a| a.name == arg.name) {
            Some(existing) => *existing = arg,
            None => self.0.push(arg),
        }
    }

    pub fn with(mut self, arg: Argument) -> Self {
        self.set(arg);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<ArgValue> {
        let pos = self.0.iter().position(|a| a.name == name)?;
        Some(self.0.remove(pos).value)
    }

    /// Reject duplicate, empty or overlong names.
    pub fn validate(&self) -> Result<(), ArgsError> {
        let mut seen = std::collections::HashSet::new();
        for arg in &self.0 {
            if arg.name.is_empty() {
                return Err(ArgsError::EmptyName);
            }
            if arg.name.len() > u8::MAX as usize {
                return Err(ArgsError::NameTooLong(arg.name.clone()));
            }
            if !seen.insert(arg.name.as_str()) {
                return Err(ArgsError::Duplicate(arg.name.clone()));
            }
        }
        Ok(())
    }

    /// Canonical packed form (sorted by name).
    pub fn pack(&self) -> Result<Vec<u8>, ArgsError> {
        self.validate()?;
        let mut sorted: Vec<&Argument> = self.0.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out = Vec::new();
        for arg in sorted {
            out.push(arg.name.len() as u8);
            out.extend_from_slice(arg.name.as_bytes());
            out.push(arg.value.data_type().tag());
            match &arg.value {
                ArgValue::String(s) => {
                    put_varint(&mut out, s.len() as u64);
                    out.extend_from_slice(s.as_bytes());
                }
                ArgValue::Int64(v) => put_varint(&mut out, zigzag(*v)),
                ArgValue::Uint64(v) | ArgValue::Time(v) => put_varint(&mut out, *v),
                ArgValue::Hash(h) => out.extend_from_slice(h),
                ArgValue::Address(a) => out.extend_from_slice(&a.to_compact()),
            }
        }
        Ok(out)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, ArgsError> {
        let mut reader = Reader { bytes, pos: 0 };
        let mut args = Arguments::new();
        while !reader.is_done() {
            let name_len = reader.byte()? as usize;
            let name = String::from_utf8(reader.take(name_len)?.to_vec())
                .map_err(|_| ArgsError::Malformed("name is not UTF-8".into()))?;
            let tag = reader.byte()?;
            let data_type = DataType::from_tag(tag)
                .ok_or_else(|| ArgsError::Malformed(format!("unknown type tag {}", tag)))?;
            let value = match data_type {
                DataType::String => {
                    let len = reader.varint()? as usize;
                    let raw = reader.take(len)?.to_vec();
                    ArgValue::String(
                        String::from_utf8(raw)
                            .map_err(|_| ArgsError::Malformed("string is not UTF-8".into()))?,
                    )
                }
                DataType::Int64 => ArgValue::Int64(unzigzag(reader.varint()?)),
                DataType::Uint64 => ArgValue::Uint64(reader.varint()?),
                DataType::Time => ArgValue::Time(reader.varint()?),
                DataType::Hash => {
                    let raw: Hash = reader
                        .take(32)?
                        .try_into()
                        .map_err(|_| ArgsError::Malformed("short hash".into()))?;
                    ArgValue::Hash(raw)
                }
                DataType::Address => {
                    let raw = reader.take(33)?;
                    ArgValue::Address(
                        Address::from_compact(raw)
                            .ok_or_else(|| ArgsError::Malformed("bad address".into()))?,
                    )
                }
            };
            if args.contains(&name) {
                return Err(ArgsError::Duplicate(name));
            }
            args.0.push(Argument { name, value });
        }
        Ok(args)
    }

    /// Packed size, failing if it exceeds `limit`.
    pub fn check_size(&self, limit: usize) -> Result<usize, ArgsError> {
        let size = self.pack()?.len();
        if size > limit {
            return Err(ArgsError::Oversize { size, limit });
        }
        Ok(size)
    }

    pub fn to_rpc(&self) -> Vec<serde_json::Value> {
        self.0.iter().map(Argument::to_rpc).collect()
    }
}

impl FromIterator<Argument> for Arguments {
    fn from_iter<I: IntoIterator<Item = Argument>>(iter: I) -> Self {
        let mut args = Arguments::new();
        for arg in iter {
            args.set(arg);
        }
        args
    }
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn byte(&mut self) -> Result<u8, ArgsError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| ArgsError::Malformed("truncated".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ArgsError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| ArgsError::Malformed("truncated".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, ArgsError> {
        let mut result = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.byte()?;
            result |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ArgsError::Malformed("varint overflow".into()))
    }
}
