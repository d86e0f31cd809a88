mod value;

pub use value::Value;

use std::{collections::HashMap, fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Register descriptor flags as reported by the structure read.
pub mod flags {
    pub const TYPE_MASK: u16 = 0x07;
    pub const FL_1: u16 = 0x01;
    pub const FL_8: u16 = 0x02;
    pub const FL_16: u16 = 0x03;
    pub const FL_32: u16 = 0x04;
    pub const FL_64: u16 = 0x05;

    pub const KIND_MASK: u16 = 0x18;
    pub const FL_U: u16 = 0x00;
    pub const FL_I: u16 = 0x08;
    pub const FL_FE: u16 = 0x10;
    pub const FL_CH: u16 = 0x18;

    pub const FL_ARR: u16 = 0x20;
    pub const FL_BND: u16 = 0x40;
    pub const FL_HEX: u16 = 0x80;
    pub const FL_RO: u16 = 0x100;
    pub const FL_VAL: u16 = 0x200;
}

#[derive(Error, Debug)]
pub enum RegError {
    #[error("malformed register structure: {0}")]
    BadStructure(&'static str),
    #[error("register '{0}' has bounds, not supported")]
    Bounded(String),
    #[error("register '{name}' has unknown type flags {flags:#06x}")]
    BadType { name: String, flags: u16 },
    #[error("register '{name}' expects {expected} bytes, got {got}")]
    BadLength {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("invalid register specification")]
    BadRegSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegWidth {
    Bit,
    Byte,
    Half,
    Word,
    Quad,
}

impl RegWidth {
    /// Bytes one item occupies on the wire.
    pub fn size(self) -> usize {
        match self {
            RegWidth::Bit | RegWidth::Byte => 1,
            RegWidth::Half => 2,
            RegWidth::Word => 4,
            RegWidth::Quad => 8,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            RegWidth::Bit => 1,
            w => w.size() as u32 * 8,
        }
    }

    fn from_flags(fl: u16) -> Option<Self> {
        match fl & flags::TYPE_MASK {
            flags::FL_1 => Some(RegWidth::Bit),
            flags::FL_8 => Some(RegWidth::Byte),
            flags::FL_16 => Some(RegWidth::Half),
            flags::FL_32 => Some(RegWidth::Word),
            flags::FL_64 => Some(RegWidth::Quad),
            _ => None,
        }
    }

    fn to_flags(self) -> u16 {
        match self {
            RegWidth::Bit => flags::FL_1,
            RegWidth::Byte => flags::FL_8,
            RegWidth::Half => flags::FL_16,
            RegWidth::Word => flags::FL_32,
            RegWidth::Quad => flags::FL_64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    Unsigned,
    Signed,
    /// IEEE float for 32 and 64 bit registers, enumeration otherwise.
    FloatEnum,
    Char,
}

impl RegKind {
    fn from_flags(fl: u16) -> Self {
        match fl & flags::KIND_MASK {
            flags::FL_I => RegKind::Signed,
            flags::FL_FE => RegKind::FloatEnum,
            flags::FL_CH => RegKind::Char,
            _ => RegKind::Unsigned,
        }
    }

    fn to_flags(self) -> u16 {
        match self {
            RegKind::Unsigned => flags::FL_U,
            RegKind::Signed => flags::FL_I,
            RegKind::FloatEnum => flags::FL_FE,
            RegKind::Char => flags::FL_CH,
        }
    }
}

/// Linear conversion from raw register values to engineering units.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaling {
    pub factor: f64,
    pub offset: f64,
    pub unit: String,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
            unit: String::new(),
        }
    }
}

impl Scaling {
    pub fn new(factor: f64, offset: f64, unit: &str) -> Self {
        Self {
            factor,
            offset,
            unit: unit.to_string(),
        }
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.factor + self.offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub index: u16,
    pub name: String,
    pub width: RegWidth,
    pub kind: RegKind,
    /// Item count, 1 for plain registers.
    pub array_len: u16,
    pub is_array: bool,
    /// Byte offset inside the module register image.
    pub offset: usize,
    pub read_only: bool,
    pub volatile: bool,
    pub hex: bool,
    pub scaling: Scaling,
}

impl Register {
    pub fn from_flags(index: u16, name: &str, fl: u16, array_len: u16) -> Result<Self, RegError> {
        if fl & flags::FL_BND != 0 {
            return Err(RegError::Bounded(name.to_string()));
        }
        let width = RegWidth::from_flags(fl).ok_or_else(|| RegError::BadType {
            name: name.to_string(),
            flags: fl,
        })?;
        let is_array = fl & flags::FL_ARR != 0;

        Ok(Register {
            index,
            name: name.to_string(),
            width,
            kind: RegKind::from_flags(fl),
            array_len: if is_array { array_len.max(1) } else { 1 },
            is_array,
            offset: 0,
            read_only: fl & flags::FL_RO != 0,
            volatile: fl & flags::FL_VAL != 0,
            hex: fl & flags::FL_HEX != 0,
            scaling: Scaling::default(),
        })
    }

    pub fn new(index: u16, name: &str, width: RegWidth, kind: RegKind) -> Self {
        Register {
            index,
            name: name.to_string(),
            width,
            kind,
            array_len: 1,
            is_array: false,
            offset: 0,
            read_only: false,
            volatile: false,
            hex: false,
            scaling: Scaling::default(),
        }
    }

    pub fn array(mut self, len: u16) -> Self {
        self.is_array = true;
        self.array_len = len.max(1);
        self
    }

    pub fn ro(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn val(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn hex(mut self) -> Self {
        self.hex = true;
        self
    }

    pub fn flags(&self) -> u16 {
        let mut fl = self.width.to_flags() | self.kind.to_flags();
        if self.is_array {
            fl |= flags::FL_ARR;
        }
        if self.hex {
            fl |= flags::FL_HEX;
        }
        if self.read_only {
            fl |= flags::FL_RO;
        }
        if self.volatile {
            fl |= flags::FL_VAL;
        }
        fl
    }

    pub fn item_size(&self) -> usize {
        self.width.size()
    }

    pub fn byte_len(&self) -> usize {
        self.item_size() * self.array_len as usize
    }

    pub fn is_float(&self) -> bool {
        self.kind == RegKind::FloatEnum && matches!(self.width, RegWidth::Word | RegWidth::Quad)
    }

    fn is_numeric(&self) -> bool {
        self.kind != RegKind::Char
    }

    fn invalid(&self, reason: impl Into<String>) -> RegError {
        RegError::InvalidValue {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn decode_item(&self, b: &[u8]) -> Value {
        match (self.width, self.kind) {
            (RegWidth::Bit, _) => Value::Bool(b[0] != 0),
            (RegWidth::Word, RegKind::FloatEnum) => {
                Value::Float(f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64)
            }
            (RegWidth::Quad, RegKind::FloatEnum) => {
                Value::Float(f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            }
            (RegWidth::Byte, RegKind::Signed) => Value::Signed(b[0] as i8 as i64),
            (RegWidth::Half, RegKind::Signed) => {
                Value::Signed(i16::from_be_bytes([b[0], b[1]]) as i64)
            }
            (RegWidth::Word, RegKind::Signed) => {
                Value::Signed(i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64)
            }
            (RegWidth::Quad, RegKind::Signed) => Value::Signed(i64::from_be_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])),
            _ => Value::Unsigned(
                b.iter()
                    .take(self.item_size())
                    .fold(0u64, |acc, x| (acc << 8) | *x as u64),
            ),
        }
    }

    /// Decodes consecutive items from `bytes`; a trailing partial item is an
    /// error.
    pub fn decode_items(&self, bytes: &[u8]) -> Result<Vec<Value>, RegError> {
        let size = self.item_size();
        if bytes.len() % size != 0 {
            return Err(RegError::BadLength {
                name: self.name.clone(),
                expected: (bytes.len() / size + 1) * size,
                got: bytes.len(),
            });
        }
        Ok(bytes.chunks(size).map(|b| self.decode_item(b)).collect())
    }

    /// Decodes the full register image.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, RegError> {
        if bytes.len() != self.byte_len() {
            return Err(RegError::BadLength {
                name: self.name.clone(),
                expected: self.byte_len(),
                got: bytes.len(),
            });
        }

        if self.kind == RegKind::Char && self.width == RegWidth::Byte {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            return Ok(Value::Text(String::from_utf8_lossy(&bytes[..end]).to_string()));
        }

        let mut items = self.decode_items(bytes)?;
        if self.is_array {
            Ok(Value::Array(items))
        } else {
            Ok(items.remove(0))
        }
    }

    fn encode_item(&self, value: &Value, out: &mut Vec<u8>) -> Result<(), RegError> {
        if self.is_float() {
            let v = value
                .as_f64()
                .ok_or_else(|| self.invalid(format!("{} is not a number", value)))?;
            match self.width {
                RegWidth::Word => out.extend_from_slice(&(v as f32).to_be_bytes()),
                _ => out.extend_from_slice(&v.to_be_bytes()),
            }
            return Ok(());
        }

        let raw: i128 = match value {
            Value::Bool(b) => *b as i128,
            Value::Unsigned(u) => *u as i128,
            Value::Signed(i) => *i as i128,
            Value::Float(f) if f.fract() == 0.0 => *f as i128,
            other => return Err(self.invalid(format!("{} is not an integer", other))),
        };

        let bits = self.width.bits();
        let (min, max) = match self.kind {
            RegKind::Signed if bits > 1 => (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1),
            _ => (0, (1i128 << bits) - 1),
        };
        if raw < min || raw > max {
            return Err(self.invalid(format!("{} out of range {}..={}", raw, min, max)));
        }

        let bytes = (raw as i64).to_be_bytes();
        out.extend_from_slice(&bytes[8 - self.item_size()..]);
        Ok(())
    }

    /// Encodes `value` for a write starting at item 0. Arrays may be shorter
    /// than the register.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, RegError> {
        let mut out = Vec::with_capacity(self.byte_len());

        if self.kind == RegKind::Char && self.width == RegWidth::Byte {
            let text = match value {
                Value::Text(s) => s,
                other => return Err(self.invalid(format!("{} is not text", other))),
            };
            if text.len() > self.array_len as usize {
                return Err(self.invalid(format!("longer than {} chars", self.array_len)));
            }
            out.extend_from_slice(text.as_bytes());
            out.resize(self.byte_len(), 0);
            return Ok(out);
        }

        match value {
            Value::Array(items) => {
                if !self.is_array {
                    return Err(self.invalid("array given for plain register"));
                }
                if items.len() > self.array_len as usize {
                    return Err(self.invalid(format!("more than {} items", self.array_len)));
                }
                for item in items {
                    self.encode_item(item, &mut out)?;
                }
            }
            item => self.encode_item(item, &mut out)?,
        }
        Ok(out)
    }

    /// Parses user input: comma separated items for arrays, plain text for
    /// char registers, `0x`/`0b` prefixes for integers.
    pub fn parse_value(&self, input: &str) -> Result<Value, RegError> {
        if self.kind == RegKind::Char && self.width == RegWidth::Byte {
            return Ok(Value::Text(input.to_string()));
        }
        if self.is_array {
            return input
                .split(',')
                .map(|s| self.parse_item(s.trim()))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }
        self.parse_item(input.trim())
    }

    fn parse_item(&self, s: &str) -> Result<Value, RegError> {
        let bad = || self.invalid(format!("cannot parse '{}'", s));

        if self.is_float() {
            return s.parse::<f64>().map(Value::Float).map_err(|_| bad());
        }
        match (self.width, self.kind) {
            (RegWidth::Bit, _) => match s {
                "1" | "true" | "on" => Ok(Value::Bool(true)),
                "0" | "false" | "off" => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            (_, RegKind::Signed) => match s.strip_prefix('-') {
                Some(abs) => parse_with_radix(abs)
                    .ok()
                    .and_then(|v| i64::try_from(v).ok())
                    .map(|v| Value::Signed(-v))
                    .ok_or_else(bad),
                None => parse_with_radix(s)
                    .ok()
                    .and_then(|v| i64::try_from(v).ok())
                    .map(Value::Signed)
                    .ok_or_else(bad),
            },
            _ => parse_with_radix(s).map(Value::Unsigned).map_err(|_| bad()),
        }
    }

    /// Scaled value of a numeric item.
    pub fn to_engineering(&self, value: &Value) -> Option<f64> {
        if !self.is_numeric() {
            return None;
        }
        value.as_f64().map(|raw| self.scaling.apply(raw))
    }

    /// Range of engineering values a single item can decode to.
    pub fn decode_range(&self) -> Option<(f64, f64)> {
        let (lo, hi) = match (self.width, self.kind) {
            (_, RegKind::Char) => return None,
            (RegWidth::Word, RegKind::FloatEnum) => (f32::MIN as f64, f32::MAX as f64),
            (RegWidth::Quad, RegKind::FloatEnum) => (f64::MIN, f64::MAX),
            (RegWidth::Bit, _) => (0.0, 1.0),
            (w, RegKind::Signed) => {
                let half = 2f64.powi(w.bits() as i32 - 1);
                (-half, half - 1.0)
            }
            (w, _) => (0.0, 2f64.powi(w.bits() as i32) - 1.0),
        };
        let (a, b) = (self.scaling.apply(lo), self.scaling.apply(hi));
        Some((a.min(b), a.max(b)))
    }

    /// Renders `value` honouring the hex display flag.
    pub fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Unsigned(u) if self.hex => format!("{:#0w$x}", u, w = self.item_size() * 2 + 2),
            Value::Array(items) => items
                .iter()
                .map(|v| self.format_value(v))
                .collect::<Vec<_>>()
                .join(" "),
            v => v.to_string(),
        }
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let access = if self.read_only { "R" } else { "RW" };
        let kind = match self.kind {
            RegKind::Unsigned => "u",
            RegKind::Signed => "i",
            RegKind::FloatEnum if self.is_float() => "f",
            RegKind::FloatEnum => "e",
            RegKind::Char => "c",
        };
        write!(
            f,
            "{:4} {:5} {}{:<2} {:<2} {}",
            self.index,
            self.offset,
            kind,
            self.width.bits(),
            access,
            self.name
        )?;
        if self.is_array {
            write!(f, "[{}]", self.array_len)?;
        }
        if !self.scaling.unit.is_empty() {
            write!(f, " ({})", self.scaling.unit)?;
        }
        Ok(())
    }
}

fn parse_with_radix(input: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = input.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = input.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else {
        input.parse()
    }
}

/// Parses structure-read entries: `u16 index, u16 flags, [u16 array size],
/// name, NUL`.
pub fn parse_structure(mut data: &[u8]) -> Result<Vec<Register>, RegError> {
    let mut regs = Vec::new();

    while !data.is_empty() {
        if data.len() < 4 {
            return Err(RegError::BadStructure("entry header truncated"));
        }
        let index = u16::from_be_bytes([data[0], data[1]]);
        let fl = u16::from_be_bytes([data[2], data[3]]);
        data = &data[4..];

        let mut array_len = 1;
        if fl & flags::FL_ARR != 0 {
            if data.len() < 2 {
                return Err(RegError::BadStructure("array size truncated"));
            }
            array_len = u16::from_be_bytes([data[0], data[1]]);
            data = &data[2..];
        }

        let end = data
            .iter()
            .position(|b| *b == 0)
            .ok_or(RegError::BadStructure("unterminated name"))?;
        let name = String::from_utf8_lossy(&data[..end]).to_string();
        data = &data[end + 1..];

        regs.push(Register::from_flags(index, &name, fl, array_len)?);
    }

    Ok(regs)
}

/// Inverse of [`parse_structure`] for a single register.
pub fn encode_structure_entry(reg: &Register) -> Vec<u8> {
    let mut out = Vec::with_capacity(reg.name.len() + 7);
    out.extend_from_slice(&reg.index.to_be_bytes());
    out.extend_from_slice(&reg.flags().to_be_bytes());
    if reg.is_array {
        out.extend_from_slice(&reg.array_len.to_be_bytes());
    }
    out.extend_from_slice(reg.name.as_bytes());
    out.push(0);
    out
}

/// All registers of a module, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    regs: Vec<Register>,
    by_name: HashMap<String, usize>,
}

impl RegisterMap {
    /// Sorts `regs` by index and lays them out back to back.
    pub fn new(mut regs: Vec<Register>) -> Self {
        regs.sort_by_key(|r| r.index);

        let mut offset = 0;
        for reg in regs.iter_mut() {
            reg.offset = offset;
            offset += reg.byte_len();
        }

        let by_name = regs
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        Self { regs, by_name }
    }

    pub fn find(&self, name: &str) -> Option<&Register> {
        self.by_name.get(name).map(|i| &self.regs[*i])
    }

    pub fn get(&self, index: u16) -> Option<&Register> {
        self.regs.iter().find(|r| r.index == index)
    }

    pub fn set_scaling(&mut self, name: &str, scaling: Scaling) -> bool {
        match self.by_name.get(name) {
            Some(i) => {
                self.regs[*i].scaling = scaling;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.regs.iter()
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.regs.iter().map(|r| r.byte_len()).sum()
    }
}

/// `module/register`, where module is a serial number or a bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegSpec {
    pub module: String,
    pub name: String,
}

impl FromStr for RegSpec {
    type Err = RegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^([-_[:alnum:]]+)/([-_.[:alnum:]]+)$").unwrap();
        }
        match RE.captures(s) {
            Some(cap) => Ok(RegSpec {
                module: cap[1].to_string(),
                name: cap[2].to_string(),
            }),
            None => Err(RegError::BadRegSpec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(name: &str, fl: u16, array_len: u16) -> Register {
        Register::from_flags(0, name, fl, array_len).unwrap()
    }

    #[test]
    fn structure_entries_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x03]);
        data.extend_from_slice(b"fw_ver\0");
        data.extend_from_slice(&[0x00, 0x01, 0x02, 0x34, 0x00, 0x18]);
        data.extend_from_slice(b"ch_V\0");
        data.extend_from_slice(&[0x00, 0x02, 0x00, 0x3A, 0x00, 0x08]);
        data.extend_from_slice(b"name\0");

        let regs = parse_structure(&data).unwrap();
        assert_eq!(regs.len(), 3);

        assert_eq!(regs[0].name, "fw_ver");
        assert_eq!(regs[0].width, RegWidth::Half);
        assert!(regs[0].read_only);
        assert!(!regs[0].is_array);

        assert_eq!(regs[1].index, 1);
        assert_eq!(regs[1].kind, RegKind::FloatEnum);
        assert_eq!(regs[1].width, RegWidth::Word);
        assert_eq!(regs[1].array_len, 24);
        assert!(regs[1].volatile);

        assert_eq!(regs[2].kind, RegKind::Char);
        assert_eq!(regs[2].byte_len(), 8);

        let map = RegisterMap::new(regs);
        assert_eq!(map.find("ch_V").unwrap().offset, 2);
        assert_eq!(map.find("name").unwrap().offset, 2 + 96);
        assert_eq!(map.total_bytes(), 106);
        assert_eq!(map.get(2).unwrap().name, "name");

        let rebuilt: Vec<u8> = map.iter().flat_map(encode_structure_entry).collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn bounded_and_broken_entries_are_rejected() {
        let mut data = vec![0x00, 0x00, 0x00, 0x42];
        data.extend_from_slice(b"lim\0");
        assert!(matches!(parse_structure(&data), Err(RegError::Bounded(_))));

        let data = [0x00, 0x00, 0x00, 0x02, b'x'];
        assert!(matches!(
            parse_structure(&data),
            Err(RegError::BadStructure(_))
        ));
    }

    #[test]
    fn values_decode_big_endian() {
        let r = reg("t", flags::FL_16 | flags::FL_I, 1);
        assert_eq!(r.decode(&[0xFF, 0xFE]).unwrap(), Value::Signed(-2));

        let r = reg("u", flags::FL_32, 1);
        assert_eq!(
            r.decode(&[0x00, 0x01, 0x00, 0x00]).unwrap(),
            Value::Unsigned(65536)
        );

        let r = reg("f", flags::FL_32 | flags::FL_FE | flags::FL_ARR, 2);
        assert_eq!(
            r.decode(&[0x3F, 0x80, 0, 0, 0x40, 0x00, 0, 0]).unwrap(),
            Value::Array(vec![Value::Float(1.0), Value::Float(2.0)])
        );

        let r = reg("s", flags::FL_8 | flags::FL_CH | flags::FL_ARR, 6);
        assert_eq!(
            r.decode(b"cvm\0\0\0").unwrap(),
            Value::Text("cvm".to_string())
        );

        assert!(matches!(
            r.decode(b"cvm"),
            Err(RegError::BadLength { expected: 6, .. })
        ));
    }

    #[test]
    fn values_encode_with_range_checks() {
        let r = reg("b", flags::FL_8, 1);
        assert_eq!(r.encode(&Value::Unsigned(200)).unwrap(), vec![200]);
        assert!(r.encode(&Value::Unsigned(256)).is_err());
        assert!(r.encode(&Value::Signed(-1)).is_err());

        let r = reg("h", flags::FL_16 | flags::FL_I, 1);
        assert_eq!(r.encode(&Value::Signed(-2)).unwrap(), vec![0xFF, 0xFE]);

        let r = reg("f", flags::FL_32 | flags::FL_FE, 1);
        assert_eq!(
            r.encode(&Value::Float(1.0)).unwrap(),
            vec![0x3F, 0x80, 0, 0]
        );

        let r = reg("s", flags::FL_8 | flags::FL_CH | flags::FL_ARR, 4);
        assert_eq!(
            r.encode(&Value::Text("ab".to_string())).unwrap(),
            vec![b'a', b'b', 0, 0]
        );
        assert!(r.encode(&Value::Text("abcde".to_string())).is_err());
    }

    #[test]
    fn user_input_parses_per_type() {
        let r = reg("u", flags::FL_16, 1);
        assert_eq!(r.parse_value("0x10").unwrap(), Value::Unsigned(16));
        assert_eq!(r.parse_value("0b101").unwrap(), Value::Unsigned(5));
        assert!(r.parse_value("abc").is_err());

        let r = reg("i", flags::FL_16 | flags::FL_I | flags::FL_ARR, 3);
        assert_eq!(
            r.parse_value("-1, 2,0x3").unwrap(),
            Value::Array(vec![
                Value::Signed(-1),
                Value::Signed(2),
                Value::Signed(3)
            ])
        );

        let r = reg("on", flags::FL_1, 1);
        assert_eq!(r.parse_value("true").unwrap(), Value::Bool(true));
    }

    #[test]
    fn scaling_and_ranges() {
        let mut r = reg("mv", flags::FL_16 | flags::FL_I, 1);
        r.scaling = Scaling::new(0.001, 0.0, "V");
        assert_eq!(r.to_engineering(&Value::Signed(1500)), Some(1.5));
        let (lo, hi) = r.decode_range().unwrap();
        assert!((lo + 32.768).abs() < 1e-9);
        assert!((hi - 32.767).abs() < 1e-9);

        let r = reg("s", flags::FL_8 | flags::FL_CH | flags::FL_ARR, 4);
        assert_eq!(r.decode_range(), None);
    }

    #[test]
    fn hex_registers_render_in_hex() {
        let r = reg("st", flags::FL_16 | flags::FL_HEX, 1);
        assert_eq!(r.format_value(&Value::Unsigned(0x1f)), "0x001f");
    }

    #[test]
    fn regspec_parses() {
        let spec: RegSpec = "0x012/ch_V".parse().unwrap();
        assert_eq!(spec.module, "0x012");
        assert_eq!(spec.name, "ch_V");
        assert!("ch_V".parse::<RegSpec>().is_err());
    }
}
