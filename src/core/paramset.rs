//! Parameter Sets

#![allow(dead_code)]
use crate::core::common::{Float, Int};
use crate::core::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Read;

/// A collection of named parameter values used to configure objects at
/// creation time and to describe materials and textures on disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamSet {
    /// Integer parameters.
    pub ints: BTreeMap<String, Vec<Int>>,

    /// Float parameters.
    pub floats: BTreeMap<String, Vec<Float>>,

    /// String parameters.
    pub strings: BTreeMap<String, Vec<String>>,

    /// Boolean parameters.
    pub bools: BTreeMap<String, Vec<bool>>,
}

impl ParamSet {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds / replaces an integer parameter.
    ///
    /// * `name`   - Parameter name.
    /// * `values` - Parameter values.
    pub fn add_int(&mut self, name: &str, values: Vec<Int>) {
        self.ints.insert(String::from(name), values);
    }

    /// Adds / replaces a float parameter.
    ///
    /// * `name`   - Parameter name.
    /// * `values` - Parameter values.
    pub fn add_float(&mut self, name: &str, values: Vec<Float>) {
        self.floats.insert(String::from(name), values);
    }

    /// Adds / replaces a string parameter.
    ///
    /// * `name`   - Parameter name.
    /// * `values` - Parameter values.
    pub fn add_string(&mut self, name: &str, values: Vec<String>) {
        self.strings.insert(String::from(name), values);
    }

    /// Adds / replaces a boolean parameter.
    ///
    /// * `name`   - Parameter name.
    /// * `values` - Parameter values.
    pub fn add_bool(&mut self, name: &str, values: Vec<bool>) {
        self.bools.insert(String::from(name), values);
    }

    /// Returns the first value of an integer parameter or a default.
    ///
    /// * `name`    - Parameter name.
    /// * `default` - Default value.
    pub fn find_one_int(&self, name: &str, default: Int) -> Int {
        self.ints
            .get(name)
            .and_then(|v| v.first().copied())
            .unwrap_or(default)
    }

    /// Returns the first value of a float parameter or a default.
    ///
    /// * `name`    - Parameter name.
    /// * `default` - Default value.
    pub fn find_one_float(&self, name: &str, default: Float) -> Float {
        self.floats
            .get(name)
            .and_then(|v| v.first().copied())
            .unwrap_or(default)
    }

    /// Returns the first value of a string parameter or a default.
    ///
    /// * `name`    - Parameter name.
    /// * `default` - Default value.
    pub fn find_one_string(&self, name: &str, default: &str) -> String {
        self.strings
            .get(name)
            .and_then(|v| v.first().cloned())
            .unwrap_or_else(|| String::from(default))
    }

    /// Returns the first value of a boolean parameter or a default.
    ///
    /// * `name`    - Parameter name.
    /// * `default` - Default value.
    pub fn find_one_bool(&self, name: &str, default: bool) -> bool {
        self.bools
            .get(name)
            .and_then(|v| v.first().copied())
            .unwrap_or(default)
    }

    /// Serializes the parameter set to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];

        out.write_u32::<LittleEndian>(self.ints.len() as u32).unwrap();
        for (name, values) in &self.ints {
            write_string(&mut out, name);
            out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
            for v in values {
                out.write_i32::<LittleEndian>(*v).unwrap();
            }
        }

        out.write_u32::<LittleEndian>(self.floats.len() as u32).unwrap();
        for (name, values) in &self.floats {
            write_string(&mut out, name);
            out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
            for v in values {
                out.write_f32::<LittleEndian>(*v).unwrap();
            }
        }

        out.write_u32::<LittleEndian>(self.strings.len() as u32).unwrap();
        for (name, values) in &self.strings {
            write_string(&mut out, name);
            out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
            for v in values {
                write_string(&mut out, v);
            }
        }

        out.write_u32::<LittleEndian>(self.bools.len() as u32).unwrap();
        for (name, values) in &self.bools {
            write_string(&mut out, name);
            out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
            for v in values {
                out.write_u8(u8::from(*v)).unwrap();
            }
        }

        out
    }

    /// Deserializes a parameter set from a reader.
    ///
    /// * `r` - The reader.
    pub fn from_reader<R: Read>(r: &mut R) -> Result<Self> {
        let mut ps = Self::new();

        for _ in 0..r.read_u32::<LittleEndian>()? {
            let name = read_string(r)?;
            let n = r.read_u32::<LittleEndian>()? as usize;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(r.read_i32::<LittleEndian>()?);
            }
            ps.ints.insert(name, values);
        }

        for _ in 0..r.read_u32::<LittleEndian>()? {
            let name = read_string(r)?;
            let n = r.read_u32::<LittleEndian>()? as usize;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(r.read_f32::<LittleEndian>()?);
            }
            ps.floats.insert(name, values);
        }

        for _ in 0..r.read_u32::<LittleEndian>()? {
            let name = read_string(r)?;
            let n = r.read_u32::<LittleEndian>()? as usize;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(read_string(r)?);
            }
            ps.strings.insert(name, values);
        }

        for _ in 0..r.read_u32::<LittleEndian>()? {
            let name = read_string(r)?;
            let n = r.read_u32::<LittleEndian>()? as usize;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(r.read_u8()? != 0);
            }
            ps.bools.insert(name, values);
        }

        Ok(ps)
    }
}

/// Writes a length-prefixed UTF-8 string.
fn write_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<LittleEndian>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0_u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Integrity(format!("invalid string: {e}")))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_one_defaults() {
        let ps = ParamSet::new();
        assert_eq!(ps.find_one_int("maxtreeletbytes", 42), 42);
        assert_eq!(ps.find_one_string("traversal", "sendcheck"), "sendcheck");
        assert!(!ps.find_one_bool("preload", false));
    }

    #[test]
    fn roundtrip() {
        let mut ps = ParamSet::new();
        ps.add_int("maxnodeprims", vec![4]);
        ps.add_float("scale", vec![1.0, 2.0]);
        ps.add_string("filename", vec![String::from("TEX0")]);
        ps.add_bool("preload", vec![true]);

        let bytes = ps.to_bytes();
        let parsed = ParamSet::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(ps, parsed);
    }
}
