use glam::Vec3;
use log::warn;

use super::reader::Reader;
use crate::error::ParseError;

const FORMAT: &str = "AMT";

/// Decoded AMT file: shading parameters keyed by material name.
#[derive(Debug, Clone, PartialEq)]
pub struct Amt {
    pub version: u32,
    pub materials: Vec<AmtMaterial>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmtMaterial {
    pub name: String,
    pub specular_strength: f32,
    pub specular_shininess: f32,
    /// Present from version 4.
    pub shadow_darkness: Option<f32>,
    /// Present from version 5.
    pub rim_exponent: Option<f32>,
    pub rim_color: Option<Vec3>,
}

/// Number of floats stored per material for each version.
pub fn fields_per_material(version: u32) -> Option<usize> {
    Some(match version {
        1 => 2,
        2 => 3,
        3 => 4,
        4 => 5,
        5 => 9,
        6 => 10,
        _ => return None,
    })
}

impl Amt {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(data, FORMAT);
        r.expect_magic(b"AMT\0")?;
        let version = r.u32()?;
        let Some(nr_fields) = fields_per_material(version) else {
            return Err(ParseError::UnsupportedVersion {
                format: FORMAT,
                version,
            });
        };
        let nr_materials = r.count(1 + nr_fields * 4)?;
        let mut materials = Vec::with_capacity(nr_materials);
        for _ in 0..nr_materials {
            let name = r.cstring()?;
            let specular_strength = r.f32()?;
            let specular_shininess = r.f32()?;
            if version >= 2 {
                r.skip(4)?;
            }
            if version >= 3 {
                r.skip(4)?;
            }
            let shadow_darkness = if version >= 4 { Some(r.f32()?) } else { None };
            let (rim_exponent, rim_color) = if version >= 5 {
                let exponent = r.f32()?;
                let color = Vec3::new(r.f32()?, r.f32()?, r.f32()?);
                (Some(exponent), Some(color))
            } else {
                (None, None)
            };
            if version >= 6 {
                r.skip(4)?;
            }
            materials.push(AmtMaterial {
                name,
                specular_strength,
                specular_shininess,
                shadow_darkness,
                rim_exponent,
                rim_color,
            });
        }

        if r.remaining() > 0 {
            warn!("AMT: {} trailing bytes after offset {}", r.remaining(), r.position());
        }
        Ok(Self { version, materials })
    }

    pub fn material(&self, name: &str) -> Option<&AmtMaterial> {
        self.materials.iter().find(|material| material.name == name)
    }
}
