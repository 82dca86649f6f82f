//! Materials

#![allow(dead_code)]
use crate::core::error::{Error, Result};
use crate::core::paramset::ParamSet;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// Locates a material: `treelet` names the material-carrying treelet that
/// owns it, `id` is the material id within that treelet's material table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterialKey {
    /// Id of the treelet carrying the material.
    pub treelet: u32,

    /// Material id.
    pub id: u32,
}

impl MaterialKey {
    /// Serialized size in bytes.
    pub const SIZE: usize = 8;

    /// Creates a new material key.
    ///
    /// * `treelet` - Id of the treelet carrying the material.
    /// * `id`      - Material id.
    pub fn new(treelet: u32, id: u32) -> Self {
        Self { treelet, id }
    }

    /// Encodes the key to its packed byte layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0_u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.treelet.to_le_bytes());
        b[4..8].copy_from_slice(&self.id.to_le_bytes());
        b
    }

    /// Decodes the key from its packed byte layout.
    ///
    /// * `b` - The bytes.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < Self::SIZE {
            return Err(Error::Integrity(String::from("short material key")));
        }
        Ok(Self {
            treelet: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            id: u32::from_le_bytes(b[4..8].try_into().unwrap()),
        })
    }
}

/// On-disk description of a float or spectrum texture. The `params` carry
/// the texture's configuration; ptex textures name their atlas file with a
/// `filename` string parameter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TextureRecord {
    /// Texture kind, e.g. "ptex" or "constant".
    pub name: String,

    /// Texture parameters.
    pub params: ParamSet,
}

impl TextureRecord {
    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        out.write_u32::<LittleEndian>(self.name.len() as u32).unwrap();
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.params.to_bytes());
        out
    }

    /// Deserializes a record from bytes.
    ///
    /// * `bytes` - The bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let name = read_string(&mut r)?;
        let params = ParamSet::from_reader(&mut r)?;
        Ok(Self { name, params })
    }

    /// Returns the ptex atlas file name, if this is a ptex texture.
    pub fn filename(&self) -> Option<String> {
        if self.name == "ptex" {
            let f = self.params.find_one_string("filename", "");
            if !f.is_empty() {
                return Some(f);
            }
        }
        None
    }
}

/// On-disk description of a material: its kind, parameters and the float /
/// spectrum textures it references by id, keyed by parameter name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterialRecord {
    /// Material kind, e.g. "matte".
    pub name: String,

    /// Material parameters.
    pub params: ParamSet,

    /// Referenced float textures, parameter name to texture id.
    pub float_textures: BTreeMap<String, u32>,

    /// Referenced spectrum textures, parameter name to texture id.
    pub spectrum_textures: BTreeMap<String, u32>,
}

impl MaterialRecord {
    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        out.write_u32::<LittleEndian>(self.name.len() as u32).unwrap();
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.params.to_bytes());

        out.write_u32::<LittleEndian>(self.float_textures.len() as u32).unwrap();
        for (name, id) in &self.float_textures {
            out.write_u32::<LittleEndian>(name.len() as u32).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.write_u32::<LittleEndian>(*id).unwrap();
        }

        out.write_u32::<LittleEndian>(self.spectrum_textures.len() as u32).unwrap();
        for (name, id) in &self.spectrum_textures {
            out.write_u32::<LittleEndian>(name.len() as u32).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.write_u32::<LittleEndian>(*id).unwrap();
        }

        out
    }

    /// Deserializes a record from bytes.
    ///
    /// * `bytes` - The bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let name = read_string(&mut r)?;
        let params = ParamSet::from_reader(&mut r)?;

        let mut float_textures = BTreeMap::new();
        for _ in 0..r.read_u32::<LittleEndian>()? {
            let tname = read_string(&mut r)?;
            float_textures.insert(tname, r.read_u32::<LittleEndian>()?);
        }

        let mut spectrum_textures = BTreeMap::new();
        for _ in 0..r.read_u32::<LittleEndian>()? {
            let tname = read_string(&mut r)?;
            spectrum_textures.insert(tname, r.read_u32::<LittleEndian>()?);
        }

        Ok(Self {
            name,
            params,
            float_textures,
            spectrum_textures,
        })
    }
}

/// A material as seen by the traverser. A `Placeholder` stands in for a
/// material that lives in a material treelet that has not been loaded; it
/// carries only the key needed to fetch it.
#[derive(Clone, Debug)]
pub enum Material {
    /// Stub material carrying only a `MaterialKey`.
    Placeholder(MaterialKey),

    /// Fully loaded material with resolved texture descriptors.
    Loaded(LoadedMaterial),
}

/// A material loaded from a material treelet together with the texture
/// descriptors it references.
#[derive(Clone, Debug)]
pub struct LoadedMaterial {
    /// Material id.
    pub id: u32,

    /// The material description.
    pub record: MaterialRecord,

    /// Resolved float texture descriptors by id.
    pub float_textures: BTreeMap<u32, TextureRecord>,

    /// Resolved spectrum texture descriptors by id.
    pub spectrum_textures: BTreeMap<u32, TextureRecord>,
}

/// Atomic reference counted `Material`.
pub type ArcMaterial = Arc<Material>;

impl Material {
    /// Returns true for placeholder materials.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Material::Placeholder(_))
    }

    /// Returns the material key of a placeholder material.
    pub fn material_key(&self) -> Option<MaterialKey> {
        match self {
            Material::Placeholder(key) => Some(*key),
            Material::Loaded(_) => None,
        }
    }

    /// Returns the loaded material, or a `PlaceholderShading` error if the
    /// caller is trying to shade a placeholder.
    pub fn require_loaded(&self) -> Result<&LoadedMaterial> {
        match self {
            Material::Loaded(m) => Ok(m),
            Material::Placeholder(key) => Err(Error::PlaceholderShading {
                treelet: key.treelet,
                id: key.id,
            }),
        }
    }
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
    fn material_key_roundtrip() {
        let key = MaterialKey::new(7, 42);
        assert_eq!(MaterialKey::from_bytes(&key.to_bytes()).unwrap(), key);
    }

    #[test]
    fn material_record_roundtrip() {
        let mut params = ParamSet::new();
        params.add_float("Kd", vec![0.5]);
        let mut record = MaterialRecord {
            name: String::from("matte"),
            params,
            ..Default::default()
        };
        record.spectrum_textures.insert(String::from("Kd"), 3);

        let parsed = MaterialRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(record, parsed);
    }

    #[test]
    fn placeholder_cannot_shade() {
        let m = Material::Placeholder(MaterialKey::new(1, 2));
        assert!(m.is_placeholder());
        assert!(m.require_loaded().is_err());
    }
}
