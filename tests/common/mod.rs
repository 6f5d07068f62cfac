#![allow(dead_code)]

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;

/// One meter in file units (inches).
pub const METER: f32 = 1.0 / 0.0254;

pub static HERO_POL: Lazy<Vec<u8>> = Lazy::new(|| pol_quad(1.0, 0.0, 3, &[(1, 1.0)]));
pub static FIELD_POL: Lazy<Vec<u8>> = Lazy::new(|| pol_quad(4.0, 0.5, 0, &[]));
pub static IDLE_MOT: Lazy<Vec<u8>> = Lazy::new(|| mot_chain(10, 3));

pub const AURA_PAE: &str = "\
object \"glow\" = {
    種類 = ビルボード,
    位置 = (ターゲット(0, 0, 1, 0) + 乱数(0.25)),
    フレーム = 0, 30,
    パーティクル数 = 4,
    テクスチャ = \"spark.png\",
}
";

pub const SCENE_XML: &str = r#"<scene>
    <settings>
        <capacity>16</capacity>
        <shadow>false</shadow>
    </settings>
    <camera>
        <position>0 2 8</position>
    </camera>
    <instance>
        <name>hero</name>
        <kind>skinned</kind>
        <model>chara/hero</model>
        <motion>idle</motion>
        <position>3 0 0</position>
    </instance>
    <instance>
        <name>field</name>
        <kind>mesh</kind>
        <model>map/field</model>
    </instance>
    <instance>
        <name>aura</name>
        <kind>effect</kind>
        <effect>fx/aura</effect>
        <targets>hero</targets>
    </instance>
    <instance>
        <name>sun</name>
        <kind>light</kind>
        <direction>0 -1 -1</direction>
    </instance>
    <background>
        <image>1</image>
    </background>
</scene>
"#;

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

/// Version 1 POL holding one untextured square of `size` meters at
/// `height` meters and a chain of `bones` bones one meter apart.
pub fn pol_quad(size: f32, height: f32, bones: usize, weights: &[(i32, f32)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"POL\0");
    put_u32(&mut out, 1);

    put_u32(&mut out, 1);
    put_str(&mut out, "plain");
    put_u32(&mut out, 0);
    put_u32(&mut out, 0);

    put_u32(&mut out, 1);
    put_u32(&mut out, 1);
    put_str(&mut out, "quad");
    put_u32(&mut out, 0);
    let s = size * METER;
    put_u32(&mut out, 4);
    for [x, z] in [[0.0, 0.0], [s, 0.0], [s, s], [0.0, s]] {
        put_f32(&mut out, x);
        put_f32(&mut out, height * METER);
        put_f32(&mut out, z);
        put_u32(&mut out, weights.len() as u32);
        for (id, weight) in weights {
            put_i32(&mut out, *id);
            put_f32(&mut out, *weight);
        }
    }
    put_u32(&mut out, 4);
    for [u, v] in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]] {
        put_f32(&mut out, u);
        put_f32(&mut out, v);
    }
    put_u32(&mut out, 2);
    for tri in [[0u32, 1, 2], [0, 2, 3]] {
        for _ in 0..2 {
            for index in tri {
                put_u32(&mut out, index);
            }
        }
        for value in [0.0, 1.0, 0.0] {
            put_f32(&mut out, value);
        }
        put_u32(&mut out, 0);
    }

    put_u32(&mut out, bones as u32);
    for i in 0..bones {
        put_str(&mut out, &format!("bone{i}"));
        put_i32(&mut out, i as i32);
        put_i32(&mut out, i as i32 - 1);
        let y = if i == 0 { 0.0 } else { METER };
        for value in [0.0, y, 0.0, 1.0, 0.0, 0.0, 0.0] {
            put_f32(&mut out, value);
        }
    }
    out
}

/// MOT for the bone chain of [`pol_quad`] resting in bind pose.
pub fn mot_chain(frames: u32, bones: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"MOT\0");
    put_u32(&mut out, 0);
    put_u32(&mut out, frames);
    put_u32(&mut out, bones as u32);
    for i in 0..bones {
        put_str(&mut out, &format!("bone{i}"));
        put_i32(&mut out, i as i32);
        put_i32(&mut out, i as i32 - 1);
        let y = if i == 0 { 0.0 } else { METER };
        for _ in 0..frames {
            for value in [0.0, y, 0.0, 1.0, 0.0, 0.0, 0.0] {
                put_f32(&mut out, value);
            }
            out.extend_from_slice(&[0; 16]);
        }
    }
    out
}

pub fn png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

fn write(root: &Path, name: &str, bytes: &[u8]) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create asset directory");
    }
    fs::write(path, bytes).expect("write asset");
}

/// Lays out a complete asset directory including `scene.xml`.
pub fn write_assets(root: &Path) {
    write(root, "chara/hero/hero.POL", &HERO_POL);
    write(root, "chara/hero/idle.MOT", &IDLE_MOT);
    write(root, "chara/hero/short.MOT", &mot_chain(10, 2));
    write(root, "map/field/field.POL", &FIELD_POL);
    write(root, "fx/aura/aura.pae", AURA_PAE.as_bytes());
    write(root, "fx/aura/spark.png", &png(2, 2, [255, 200, 0, 255]));
    write(root, "cg/1.png", &png(8, 8, [0, 0, 64, 255]));
    write(root, "scene.xml", SCENE_XML.as_bytes());
}
