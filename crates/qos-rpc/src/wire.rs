//! A minimal protobuf wire format writer and reader.
//!
//! Only what the coordinator messages need: varints, zigzag varints,
//! fixed32/64, length delimited bytes and strings, and nested messages with
//! a bounded depth. Zero scalars and empty strings are omitted on write.

use std::fmt;

const VARINT: u8 = 0;
const FIXED64: u8 = 1;
const LEN: u8 = 2;
const FIXED32: u8 = 5;

/// Deepest nesting of messages accepted by [`Writer`] and [`Reader`].
pub const MAX_DEPTH: usize = 8;

/// Errors produced while writing or reading the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The writer went past its size limit.
    Full,
    /// The input ended in the middle of a field.
    Truncated,
    /// A varint ran past ten bytes, or a tag was unusable.
    Malformed,
    /// A field was present with an unexpected wire type.
    WireType {
        /// Field number.
        field: u32,
        /// Wire type found.
        found: u8,
    },
    /// A string field was not UTF-8.
    Utf8 {
        /// Field number.
        field: u32,
    },
    /// Messages nested deeper than [`MAX_DEPTH`].
    Depth,
    /// `end_message` without `begin_message`, or finishing with open messages.
    Unbalanced,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Full => write!(f, "message exceeds buffer limit"),
            WireError::Truncated => write!(f, "message truncated"),
            WireError::Malformed => write!(f, "malformed varint or tag"),
            WireError::WireType { field, found } => {
                write!(f, "field {field} has unexpected wire type {found}")
            }
            WireError::Utf8 { field } => write!(f, "field {field} is not valid utf-8"),
            WireError::Depth => write!(f, "messages nested deeper than {MAX_DEPTH}"),
            WireError::Unbalanced => write!(f, "unbalanced nested messages"),
        }
    }
}

impl std::error::Error for WireError {}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, WireError> {
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        let (&byte, rest) = buf.split_first().ok_or(WireError::Truncated)?;
        *buf = rest;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(WireError::Malformed)
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Encodes fields into an owned buffer bounded by a byte limit.
#[derive(Debug)]
pub struct Writer {
    buf: Vec<u8>,
    limit: usize,
    open: Vec<usize>,
}

impl Writer {
    /// Reuses `buf`'s allocation; anything already in it is discarded.
    pub fn new(mut buf: Vec<u8>, limit: usize) -> Self {
        buf.clear();
        Self {
            buf,
            limit,
            open: Vec::new(),
        }
    }

    fn check(&self) -> Result<(), WireError> {
        if self.buf.len() > self.limit {
            Err(WireError::Full)
        } else {
            Ok(())
        }
    }

    fn tag(&mut self, field: u32, wire_type: u8) {
        put_varint(&mut self.buf, ((field as u64) << 3) | wire_type as u64);
    }

    /// Writes an unsigned varint.
    pub fn varint(&mut self, field: u32, value: u64) -> Result<(), WireError> {
        if value == 0 {
            return Ok(());
        }
        self.tag(field, VARINT);
        put_varint(&mut self.buf, value);
        self.check()
    }

    /// Writes a zigzag encoded signed varint.
    pub fn sint(&mut self, field: u32, value: i64) -> Result<(), WireError> {
        self.varint(field, zigzag(value))
    }

    pub fn fixed32(&mut self, field: u32, value: u32) -> Result<(), WireError> {
        if value == 0 {
            return Ok(());
        }
        self.tag(field, FIXED32);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self.check()
    }

    pub fn fixed64(&mut self, field: u32, value: u64) -> Result<(), WireError> {
        if value == 0 {
            return Ok(());
        }
        self.tag(field, FIXED64);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self.check()
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) -> Result<(), WireError> {
        if value.is_empty() {
            return Ok(());
        }
        self.tag(field, LEN);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self.check()
    }

    pub fn string(&mut self, field: u32, value: &str) -> Result<(), WireError> {
        self.bytes(field, value.as_bytes())
    }

    /// Opens a nested message. Every field written until the matching
    /// [`end_message`](Self::end_message) belongs to it.
    pub fn begin_message(&mut self, field: u32) -> Result<(), WireError> {
        if self.open.len() >= MAX_DEPTH {
            return Err(WireError::Depth);
        }
        self.tag(field, LEN);
        self.open.push(self.buf.len());
        self.check()
    }

    /// Closes the innermost nested message, inserting its length prefix.
    pub fn end_message(&mut self) -> Result<(), WireError> {
        let start = self.open.pop().ok_or(WireError::Unbalanced)?;
        let mut prefix = Vec::with_capacity(5);
        put_varint(&mut prefix, (self.buf.len() - start) as u64);
        self.buf.splice(start..start, prefix);
        self.check()
    }

    /// Returns the encoded bytes.
    pub fn finish(self) -> Result<Vec<u8>, WireError> {
        if !self.open.is_empty() {
            return Err(WireError::Unbalanced);
        }
        Ok(self.buf)
    }
}

/// A decoded field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// A field number and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub number: u32,
    pub value: Value<'a>,
}

impl<'a> Field<'a> {
    fn wire_type(&self) -> u8 {
        match self.value {
            Value::Varint(_) => VARINT,
            Value::Fixed64(_) => FIXED64,
            Value::Bytes(_) => LEN,
            Value::Fixed32(_) => FIXED32,
        }
    }

    fn mismatch(&self) -> WireError {
        WireError::WireType {
            field: self.number,
            found: self.wire_type(),
        }
    }

    pub fn as_varint(&self) -> Result<u64, WireError> {
        match self.value {
            Value::Varint(v) => Ok(v),
            _ => Err(self.mismatch()),
        }
    }

    pub fn as_bytes(&self) -> Result<&'a [u8], WireError> {
        match self.value {
            Value::Bytes(b) => Ok(b),
            _ => Err(self.mismatch()),
        }
    }
}

/// Iterates over the fields of one message.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn read_field(&mut self) -> Result<Field<'a>, WireError> {
        let key = get_varint(&mut self.rest)?;
        let number = u32::try_from(key >> 3).map_err(|_| WireError::Malformed)?;
        if number == 0 {
            return Err(WireError::Malformed);
        }

        let value = match (key & 0x7) as u8 {
            VARINT => Value::Varint(get_varint(&mut self.rest)?),
            FIXED64 => {
                let (bytes, rest) = split(self.rest, 8)?;
                self.rest = rest;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Value::Fixed64(u64::from_le_bytes(raw))
            }
            LEN => {
                let len = usize::try_from(get_varint(&mut self.rest)?)
                    .map_err(|_| WireError::Truncated)?;
                let (bytes, rest) = split(self.rest, len)?;
                self.rest = rest;
                Value::Bytes(bytes)
            }
            FIXED32 => {
                let (bytes, rest) = split(self.rest, 4)?;
                self.rest = rest;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Value::Fixed32(u32::from_le_bytes(raw))
            }
            _ => return Err(WireError::Malformed),
        };

        Ok(Field { number, value })
    }
}

fn split(buf: &[u8], len: usize) -> Result<(&[u8], &[u8]), WireError> {
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    Ok(buf.split_at(len))
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Field<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let field = self.read_field();
        if field.is_err() {
            // stop after the first error, the rest cannot be framed
            self.rest = &[];
        }
        Some(field)
    }
}

/// Random access over the fields of one message. Absent scalar fields read
/// as their zero value.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, depth: 0 }
    }

    pub fn fields(&self) -> Fields<'a> {
        Fields { rest: self.buf }
    }

    /// The first occurrence of `number`.
    pub fn find(&self, number: u32) -> Result<Option<Field<'a>>, WireError> {
        for field in self.fields() {
            let field = field?;
            if field.number == number {
                return Ok(Some(field));
            }
        }
        Ok(None)
    }

    /// Every occurrence of `number`, in order.
    pub fn find_all(&self, number: u32) -> impl Iterator<Item = Result<Field<'a>, WireError>> {
        self.fields()
            .filter(move |field| field.as_ref().map_or(true, |f| f.number == number))
    }

    pub fn varint(&self, number: u32) -> Result<u64, WireError> {
        self.find(number)?.map_or(Ok(0), |f| f.as_varint())
    }

    pub fn sint(&self, number: u32) -> Result<i64, WireError> {
        self.varint(number).map(unzigzag)
    }

    pub fn fixed32(&self, number: u32) -> Result<u32, WireError> {
        match self.find(number)? {
            None => Ok(0),
            Some(Field {
                value: Value::Fixed32(v),
                ..
            }) => Ok(v),
            Some(f) => Err(f.mismatch()),
        }
    }

    pub fn fixed64(&self, number: u32) -> Result<u64, WireError> {
        match self.find(number)? {
            None => Ok(0),
            Some(Field {
                value: Value::Fixed64(v),
                ..
            }) => Ok(v),
            Some(f) => Err(f.mismatch()),
        }
    }

    pub fn bytes(&self, number: u32) -> Result<&'a [u8], WireError> {
        self.find(number)?.map_or(Ok(&[][..]), |f| f.as_bytes())
    }

    pub fn string(&self, number: u32) -> Result<&'a str, WireError> {
        std::str::from_utf8(self.bytes(number)?).map_err(|_| WireError::Utf8 { field: number })
    }

    /// Opens a length delimited field as a nested message.
    pub fn message(&self, field: &Field<'a>) -> Result<Reader<'a>, WireError> {
        if self.depth + 1 >= MAX_DEPTH {
            return Err(WireError::Depth);
        }
        Ok(Reader {
            buf: field.as_bytes()?,
            depth: self.depth + 1,
        })
    }

    /// Every occurrence of `number`, opened as nested messages.
    pub fn messages(&self, number: u32) -> impl Iterator<Item = Result<Reader<'a>, WireError>> {
        let this = *self;
        self.find_all(number)
            .map(move |field| field.and_then(|f| this.message(&f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varints_use_little_endian_groups() {
        let mut w = Writer::new(Vec::new(), 64);
        w.varint(1, 300).unwrap();
        assert_eq!(w.finish().unwrap(), vec![0x08, 0xac, 0x02]);
    }

    #[test]
    fn defaults_are_omitted() {
        let mut w = Writer::new(Vec::new(), 64);
        w.varint(1, 0).unwrap();
        w.string(2, "").unwrap();
        w.fixed32(3, 0).unwrap();
        assert!(w.finish().unwrap().is_empty());
    }

    #[test]
    fn nested_messages_get_length_prefixes() -> Result<(), WireError> {
        let mut w = Writer::new(Vec::new(), 1024);
        w.string(1, "outer")?;
        w.begin_message(2)?;
        w.sint(1, -3)?;
        w.begin_message(2)?;
        w.fixed64(1, 42)?;
        w.end_message()?;
        w.end_message()?;
        w.begin_message(2)?;
        w.varint(1, 7)?;
        w.end_message()?;
        let buf = w.finish()?;

        let r = Reader::new(&buf);
        assert_eq!(r.string(1)?, "outer");

        let inner: Vec<_> = r.messages(2).collect::<Result<_, _>>()?;
        assert_eq!(inner.len(), 2);
        assert_eq!(inner[0].sint(1)?, -3);

        let innermost = inner[0].messages(2).next().unwrap()?;
        assert_eq!(innermost.fixed64(1)?, 42);
        assert_eq!(inner[1].varint(1)?, 7);

        Ok(())
    }

    #[test]
    fn absent_fields_read_as_zero() -> Result<(), WireError> {
        let r = Reader::new(&[]);
        assert_eq!(r.varint(4)?, 0);
        assert_eq!(r.string(4)?, "");
        assert_eq!(r.messages(4).count(), 0);
        Ok(())
    }

    #[test]
    fn writer_respects_limit() {
        let mut w = Writer::new(Vec::new(), 4);
        assert_eq!(w.string(1, "too long"), Err(WireError::Full));
    }

    #[test]
    fn depth_is_bounded() {
        let mut w = Writer::new(Vec::new(), 1024);
        for _ in 0..MAX_DEPTH {
            w.begin_message(1).unwrap();
        }
        assert_eq!(w.begin_message(1), Err(WireError::Depth));
    }

    #[test]
    fn unbalanced_messages_are_rejected() {
        let mut w = Writer::new(Vec::new(), 1024);
        assert_eq!(w.end_message(), Err(WireError::Unbalanced));

        let mut w = Writer::new(Vec::new(), 1024);
        w.begin_message(1).unwrap();
        assert_eq!(w.finish(), Err(WireError::Unbalanced));
    }

    #[test]
    fn truncated_input_is_an_error() {
        // field 1, length 5, only two bytes follow
        let r = Reader::new(&[0x0a, 0x05, b'a', b'b']);
        assert_eq!(r.string(1), Err(WireError::Truncated));
    }

    #[test]
    fn wrong_wire_type_is_an_error() {
        let r = Reader::new(&[0x08, 0x01]);
        assert_eq!(
            r.string(1),
            Err(WireError::WireType { field: 1, found: 0 })
        );
    }
}
