//! Canonical bencode — the deterministic encoding under every signed Meta
//! and every protocol payload.
//!
//! Four shapes: integers (`i…e`), byte strings (`<len>:<bytes>`), lists
//! (`l…e`) and dictionaries (`d…e`). Dictionary keys are byte strings kept
//! in a BTreeMap, so encoding is canonical by construction: the same value
//! always produces the same bytes. That property is load-bearing — Meta
//! signatures cover the encoded bytes, and revision ties are broken by
//! comparing them.

use std::collections::BTreeMap;

use thiserror::Error;

/// Input is untrusted (wire payloads); bound recursion so nested lists
/// cannot exhaust the stack.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("truncated input at byte {0}")]
    Truncated(usize),

    #[error("unexpected byte {byte:#04x} at {pos}")]
    Unexpected { byte: u8, pos: usize },

    #[error("invalid integer")]
    BadInt,

    #[error("byte-string length overflows")]
    BadLength,

    #[error("dictionary keys not strictly ascending")]
    UnsortedKeys,

    #[error("trailing bytes after value")]
    TrailingBytes,

    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("expected {expected}, found {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing dictionary key {0:?}")]
    MissingKey(String),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }

    pub fn as_int(&self) -> Result<i64, BencodeError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(BencodeError::WrongType {
                expected: "int",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], BencodeError> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(BencodeError::WrongType {
                expected: "bytes",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], BencodeError> {
        match self {
            Value::List(l) => Ok(l),
            other => Err(BencodeError::WrongType {
                expected: "list",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>, BencodeError> {
        match self {
            Value::Dict(d) => Ok(d),
            other => Err(BencodeError::WrongType {
                expected: "dict",
                found: other.type_name(),
            }),
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_into(out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Decode exactly one value, rejecting trailing bytes.
    pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
        let mut parser = Parser {
            input,
            pos: 0,
            depth: 0,
        };
        let value = parser.parse_value()?;
        if parser.pos != input.len() {
            return Err(BencodeError::TrailingBytes);
        }
        Ok(value)
    }
}

/// Dictionary accessors used by Meta and protocol decoding.
pub trait DictExt {
    fn req(&self, key: &str) -> Result<&Value, BencodeError>;
    fn req_int(&self, key: &str) -> Result<i64, BencodeError>;
    fn req_bytes(&self, key: &str) -> Result<&[u8], BencodeError>;
    fn opt(&self, key: &str) -> Option<&Value>;
}

impl DictExt for BTreeMap<Vec<u8>, Value> {
    fn req(&self, key: &str) -> Result<&Value, BencodeError> {
        self.get(key.as_bytes())
            .ok_or_else(|| BencodeError::MissingKey(key.to_string()))
    }

    fn req_int(&self, key: &str) -> Result<i64, BencodeError> {
        self.req(key)?.as_int()
    }

    fn req_bytes(&self, key: &str) -> Result<&[u8], BencodeError> {
        self.req(key)?.as_bytes()
    }

    fn opt(&self, key: &str) -> Option<&Value> {
        self.get(key.as_bytes())
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated(self.pos))
    }

    fn advance(&mut self) -> Result<u8, BencodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn parse_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            byte => Err(BencodeError::Unexpected {
                byte,
                pos: self.pos,
            }),
        }
    }

    fn parse_int(&mut self) -> Result<Value, BencodeError> {
        self.advance()?; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.advance()?; // 'e'

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::BadInt)?;
        // Canonical form only: no leading zeros, no "-0", no empty body.
        if text.is_empty()
            || text == "-"
            || (text.len() > 1 && text.starts_with('0'))
            || text.starts_with("-0")
        {
            return Err(BencodeError::BadInt);
        }
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| BencodeError::BadInt)
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            match self.peek()? {
                b'0'..=b'9' => self.pos += 1,
                byte => {
                    return Err(BencodeError::Unexpected {
                        byte,
                        pos: self.pos,
                    })
                }
            }
        }
        let digits = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| BencodeError::BadLength)?;
        if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
            return Err(BencodeError::BadLength);
        }
        let len: usize = digits.parse().map_err(|_| BencodeError::BadLength)?;
        self.advance()?; // ':'

        if self.input.len() - self.pos < len {
            return Err(BencodeError::Truncated(self.pos));
        }
        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value, BencodeError> {
        self.advance()?; // 'l'
        self.descend()?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.advance()?; // 'e'
        self.depth -= 1;
        Ok(Value::List(items))
    }

    fn descend(&mut self) -> Result<(), BencodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        Ok(())
    }

    fn parse_dict(&mut self) -> Result<Value, BencodeError> {
        self.advance()?; // 'd'
        self.descend()?;
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            let key = self.parse_bytes()?;
            if let Some(prev) = &last_key {
                if *prev >= key {
                    return Err(BencodeError::UnsortedKeys);
                }
            }
            let value = self.parse_value()?;
            last_key = Some(key.clone());
            map.insert(key, value);
        }
        self.advance()?; // 'e'
        self.depth -= 1;
        Ok(Value::Dict(map))
    }
}
