use glam::{Quat, Vec3};
use log::warn;

use super::reader::Reader;
use crate::error::ParseError;

const FORMAT: &str = "MOT";
/// Per-frame bytes following the transform whose meaning is unknown.
const UNKNOWN_FRAME_BYTES: usize = 16;
const FRAME_SIZE: usize = 12 + 16 + UNKNOWN_FRAME_BYTES;

/// Decoded MOT file: one keyframe track per bone.
#[derive(Debug, Clone, PartialEq)]
pub struct Mot {
    pub nr_frames: usize,
    pub bones: Vec<MotBone>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotBone {
    pub name: String,
    pub id: i32,
    pub parent_id: Option<i32>,
    pub frames: Vec<MotFrame>,
}

/// Parent-relative bone transform for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotFrame {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Mot {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(data, FORMAT);
        r.expect_magic(b"MOT\0")?;
        let version = r.u32()?;
        if version != 0 {
            return Err(ParseError::UnsupportedVersion {
                format: FORMAT,
                version,
            });
        }
        let nr_frames = r.u32()? as usize;
        let bone_size = 9usize.saturating_add(nr_frames.saturating_mul(FRAME_SIZE));
        let nr_bones = r.count(bone_size)?;

        let mut bones = Vec::with_capacity(nr_bones);
        for _ in 0..nr_bones {
            let name = r.cstring()?;
            let id = r.i32()?;
            let parent = r.i32()?;
            let mut frames = Vec::with_capacity(nr_frames);
            for _ in 0..nr_frames {
                let position = r.position3()?;
                let rotation = r.rotation()?;
                r.skip(UNKNOWN_FRAME_BYTES)?;
                frames.push(MotFrame { position, rotation });
            }
            bones.push(MotBone {
                name,
                id,
                parent_id: (parent >= 0).then_some(parent),
                frames,
            });
        }

        if r.remaining() > 0 {
            warn!("MOT: {} trailing bytes after offset {}", r.remaining(), r.position());
        }
        Ok(Self { nr_frames, bones })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::testdata::{MotBuilder, METER};

    #[test]
    fn parses_frames_and_skips_unknown_block() {
        let data = MotBuilder::new(3)
            .bone("root", 0, -1, |f| [f as f32 * METER, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0])
            .bone("tip", 1, 0, |_| [0.0, 0.0, METER, 1.0, 0.0, 0.0, 0.0])
            .build();
        let mot = Mot::parse(&data).unwrap();
        assert_eq!(mot.nr_frames, 3);
        assert_eq!(mot.bones.len(), 2);
        assert!((mot.bones[0].frames[2].position.x - 2.0).abs() < 1e-4);
        assert!((mot.bones[1].frames[0].position.z + 1.0).abs() < 1e-4);
        assert_eq!(mot.bones[1].parent_id, Some(0));
    }

    #[test]
    fn rejects_nonzero_version() {
        let mut data = MotBuilder::new(1).build();
        data[4] = 1;
        assert!(matches!(
            Mot::parse(&data),
            Err(ParseError::UnsupportedVersion { version: 1, .. })
        ));
    }

    #[test]
    fn rejects_truncated_frames() {
        let data = MotBuilder::new(2)
            .bone("root", 0, -1, |_| [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0])
            .build();
        assert!(Mot::parse(&data[..data.len() - 20]).is_err());
    }
}
