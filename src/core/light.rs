//! Lights

#![allow(dead_code)]
use crate::core::error::Result;
use crate::core::geometry::Transform;
use crate::core::paramset::ParamSet;
use crate::core::spectrum::RGBSpectrum;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;
use std::sync::Arc;

/// Scene-level description of an area light, read as an external input when
/// a scene is opened. Emissive meshes reference these by id.
#[derive(Clone, Debug, PartialEq)]
pub struct AreaLightRecord {
    /// Area light id.
    pub id: u32,

    /// Light parameters ("L", "twosided", "samples").
    pub params: ParamSet,

    /// Light to world transformation.
    pub light_to_world: Transform,
}

impl AreaLightRecord {
    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        out.write_u32::<LittleEndian>(self.id).unwrap();
        for row in &self.light_to_world.m.m {
            for v in row {
                out.write_f32::<LittleEndian>(*v).unwrap();
            }
        }
        out.extend_from_slice(&self.params.to_bytes());
        out
    }

    /// Deserializes a record from a reader.
    ///
    /// * `r` - The reader.
    pub fn from_reader<R: Read>(r: &mut R) -> Result<Self> {
        let id = r.read_u32::<LittleEndian>()?;
        let mut m = crate::core::geometry::IDENTITY_MATRIX;
        for row in m.m.iter_mut() {
            for v in row.iter_mut() {
                *v = r.read_f32::<LittleEndian>()?;
            }
        }
        let params = ParamSet::from_reader(r)?;
        Ok(Self {
            id,
            params,
            light_to_world: Transform::new(m),
        })
    }
}

/// A diffuse area light bound to an emissive triangle during treelet
/// finalization.
#[derive(Clone, Debug)]
pub struct DiffuseAreaLight {
    /// Unique light id reported with hits.
    pub id: u32,

    /// Emitted radiance.
    pub l_emit: RGBSpectrum,

    /// Whether the light emits from both sides of the surface.
    pub two_sided: bool,
}

/// Atomic reference counted `DiffuseAreaLight`.
pub type ArcAreaLight = Arc<DiffuseAreaLight>;

impl DiffuseAreaLight {
    /// Creates a diffuse area light from its scene record.
    ///
    /// * `record` - The area light record.
    /// * `id`     - The id the materialized light reports with hits.
    pub fn new(record: &AreaLightRecord, id: u32) -> Self {
        let l = record
            .params
            .floats
            .get("L")
            .map(|v| {
                if v.len() >= 3 {
                    RGBSpectrum::from_rgb(v[0], v[1], v[2])
                } else {
                    RGBSpectrum::new(1.0)
                }
            })
            .unwrap_or_else(|| RGBSpectrum::new(1.0));

        Self {
            id,
            l_emit: l,
            two_sided: record.params.find_one_bool("twosided", false),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut params = ParamSet::new();
        params.add_float("L", vec![1.0, 0.5, 0.25]);
        let record = AreaLightRecord {
            id: 9,
            params,
            light_to_world: Transform::default(),
        };

        let bytes = record.to_bytes();
        let parsed = AreaLightRecord::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(record, parsed);
    }

    #[test]
    fn light_takes_radiance_from_record() {
        let mut params = ParamSet::new();
        params.add_float("L", vec![2.0, 2.0, 2.0]);
        let record = AreaLightRecord {
            id: 3,
            params,
            light_to_world: Transform::default(),
        };

        let light = DiffuseAreaLight::new(&record, 5);
        assert_eq!(light.id, 5);
        assert_eq!(light.l_emit, RGBSpectrum::new(2.0));
    }
}
