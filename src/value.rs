//! The typed data cell held by a leaf link.
//!
//! A cell stores one committed value and lazily caches the other
//! representations after the first conversion. Every write invalidates the
//! cache. Conversions that cannot succeed (e.g. a non-numeric string as
//! int) report failure without touching the cache.

#[cfg(test)]
mod tests;

use std::fmt;

/// The committed type of a cell.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    Null,
    Int,
    Real,
    String,
    Bytes,
    Variant,
}

/// A dynamically typed value with a type-name tag.
///
/// The tag is opaque to the registry; peers that agree on it can carry any
/// payload, textual or binary, through the tree and over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub type_name: String,
    pub repr: VariantRepr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariantRepr {
    Text(String),
    Bin(Vec<u8>),
}

impl Variant {
    pub fn text(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        Variant { type_name: type_name.into(), repr: VariantRepr::Text(value.into()) }
    }

    pub fn bin(type_name: impl Into<String>, value: Vec<u8>) -> Self {
        Variant { type_name: type_name.into(), repr: VariantRepr::Bin(value) }
    }

    /// The textual rendering, when this variant has one.
    pub fn as_text(&self) -> Option<&str> {
        match &self.repr {
            VariantRepr::Text(s) => Some(s),
            VariantRepr::Bin(_) => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            VariantRepr::Text(s) => write!(f, "{}", s),
            VariantRepr::Bin(b) => write!(f, "<{}:{} bytes>", self.type_name, b.len()),
        }
    }
}

/// The value storage of one leaf link.
#[derive(Debug, Default)]
pub struct Cell {
    dtype: DataType,
    int: i64,
    real: f64,
    string: String,
    bytes: Vec<u8>,
    variant: Option<Variant>,
    have_int: bool,
    have_real: bool,
    have_string: bool,
    have_bytes: bool,
    have_variant: bool,
    /// Counts every local write, including ignored-same ones.
    local_update_count: u32,
}

impl Cell {
    pub fn new() -> Self {
        Cell::default()
    }

    pub fn data_type(&self) -> DataType {
        self.dtype
    }

    pub fn local_update_count(&self) -> u32 {
        self.local_update_count
    }

    pub fn bump_update_count(&mut self) {
        self.local_update_count = self.local_update_count.wrapping_add(1);
    }

    fn reset_have(&mut self) {
        self.have_int = false;
        self.have_real = false;
        self.have_string = false;
        self.have_bytes = false;
        self.have_variant = false;
    }

    pub fn set_int(&mut self, value: i64) {
        self.reset_have();
        self.int = value;
        self.dtype = DataType::Int;
        self.have_int = true;
    }

    pub fn set_real(&mut self, value: f64) {
        self.reset_have();
        self.real = value;
        self.dtype = DataType::Real;
        self.have_real = true;
    }

    pub fn set_string(&mut self, value: &str) {
        self.reset_have();
        self.string.clear();
        self.string.push_str(value);
        self.dtype = DataType::String;
        self.have_string = true;
    }

    pub fn set_bytes(&mut self, value: &[u8]) {
        self.reset_have();
        self.bytes.clear();
        self.bytes.extend_from_slice(value);
        self.dtype = DataType::Bytes;
        self.have_bytes = true;
    }

    pub fn set_variant(&mut self, value: Variant) {
        self.reset_have();
        self.variant = Some(value);
        self.dtype = DataType::Variant;
        self.have_variant = true;
    }

    /// Integer view. Caches the converted value on success.
    pub fn to_int(&mut self) -> Option<i64> {
        if !self.have_int {
            let converted = match self.dtype {
                DataType::Real => Some(self.real as i64),
                DataType::String => self.string.trim().parse::<i64>().ok(),
                DataType::Bytes => std::str::from_utf8(&self.bytes).ok().and_then(|s| s.trim().parse().ok()),
                DataType::Variant => {
                    self.variant.as_ref().and_then(|v| v.as_text()).and_then(|s| s.trim().parse().ok())
                }
                _ => None,
            };
            match converted {
                Some(v) => {
                    self.int = v;
                    self.have_int = true;
                }
                None => return None,
            }
        }
        Some(self.int)
    }

    /// Real view. Caches the converted value on success.
    pub fn to_real(&mut self) -> Option<f64> {
        if !self.have_real {
            let converted = match self.dtype {
                DataType::Int => Some(self.int as f64),
                DataType::String => self.string.trim().parse::<f64>().ok(),
                DataType::Bytes => std::str::from_utf8(&self.bytes).ok().and_then(|s| s.trim().parse().ok()),
                DataType::Variant => {
                    self.variant.as_ref().and_then(|v| v.as_text()).and_then(|s| s.trim().parse().ok())
                }
                _ => None,
            };
            match converted {
                Some(v) => {
                    self.real = v;
                    self.have_real = true;
                }
                None => return None,
            }
        }
        Some(self.real)
    }

    /// String view: decimal for numbers, utf-8 for bytes, text rendering
    /// for variants that have one.
    pub fn to_string_val(&mut self) -> Option<String> {
        if !self.have_string {
            let converted = match self.dtype {
                DataType::Int => Some(self.int.to_string()),
                DataType::Real => Some(format_real(self.real)),
                DataType::Bytes => Some(String::from_utf8_lossy(&self.bytes).into_owned()),
                DataType::Variant => self.variant.as_ref().and_then(|v| v.as_text()).map(str::to_string),
                _ => None,
            };
            match converted {
                Some(v) => {
                    self.string = v;
                    self.have_string = true;
                }
                None => return None,
            }
        }
        Some(self.string.clone())
    }

    pub fn to_bytes(&mut self) -> Option<Vec<u8>> {
        if !self.have_bytes {
            let converted = match self.dtype {
                DataType::Int => Some(self.int.to_string().into_bytes()),
                DataType::Real => Some(format_real(self.real).into_bytes()),
                DataType::String => Some(self.string.as_bytes().to_vec()),
                DataType::Variant => {
                    self.variant.as_ref().and_then(|v| v.as_text()).map(|s| s.as_bytes().to_vec())
                }
                _ => None,
            };
            match converted {
                Some(v) => {
                    self.bytes = v;
                    self.have_bytes = true;
                }
                None => return None,
            }
        }
        Some(self.bytes.clone())
    }

    pub fn to_variant(&mut self) -> Option<Variant> {
        if !self.have_variant {
            let converted = match self.dtype {
                DataType::Int => Some(Variant::text("int", self.int.to_string())),
                DataType::Real => Some(Variant::text("real", format_real(self.real))),
                DataType::String => Some(Variant::text("string", self.string.clone())),
                DataType::Bytes => {
                    Some(Variant::text("string", String::from_utf8_lossy(&self.bytes).into_owned()))
                }
                _ => None,
            };
            match converted {
                Some(v) => {
                    self.variant = Some(v);
                    self.have_variant = true;
                }
                None => return None,
            }
        }
        self.variant.clone()
    }
}

/// Shortest round-trip decimal rendering of a real value.
pub fn format_real(value: f64) -> String {
    format!("{}", value)
}
