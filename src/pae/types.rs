use glam::Vec3;

/// Maximum number of `+`-chained units in one position alternative.
pub const MAX_POSITION_UNITS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticleType {
    #[default]
    Billboard,
    PolygonObject,
    SwordBlur,
    /// Perturbs the camera instead of drawing anything.
    CameraQuake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveType {
    #[default]
    Fixed,
    Linear,
    Emitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpVectorType {
    #[default]
    YAxis,
    XAxis,
    ZAxis,
    Camera,
}

impl UpVectorType {
    /// World-space axis used as the emitter's base direction.
    pub fn axis(self) -> Vec3 {
        match self {
            UpVectorType::YAxis | UpVectorType::Camera => Vec3::Y,
            UpVectorType::XAxis => Vec3::X,
            UpVectorType::ZAxis => Vec3::Z,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendType {
    #[default]
    Normal,
    Additive,
}

/// One term of a position formula.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionUnit {
    None,
    /// World-space coordinates.
    Absolute(Vec3),
    /// Offset from a named bone of the `target`-th effect target.
    Bone {
        target: usize,
        bone: String,
        offset: Vec3,
    },
    /// Offset in the target's column space: x/z scaled by the column
    /// radius, y by the column height, rotated by the column angle.
    Target { target: usize, offset: Vec3 },
    /// Random point within `radius`, chosen once per particle.
    Random(f32),
    /// As `Random`, with the Y component forced non-negative.
    RandomPositiveY(f32),
}

impl PositionUnit {
    /// Random units are rolled per particle; the rest are resolved once
    /// per object each tick.
    pub fn is_per_particle(&self) -> bool {
        matches!(self, PositionUnit::Random(_) | PositionUnit::RandomPositiveY(_))
    }
}

/// A `+`-chained sequence of up to [`MAX_POSITION_UNITS`] units.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionFormula {
    pub units: Vec<PositionUnit>,
}

impl PositionFormula {
    pub fn new(units: Vec<PositionUnit>) -> Self {
        Self { units }
    }

    /// True when any unit depends on the world (targets or absolute).
    pub fn has_anchor(&self) -> bool {
        self.units.iter().any(|unit| {
            matches!(
                unit,
                PositionUnit::Absolute(_) | PositionUnit::Bone { .. } | PositionUnit::Target { .. }
            )
        })
    }
}

/// Declarative description of one particle object.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleObject {
    pub name: String,
    pub kind: ParticleType,
    pub move_type: MoveType,
    pub up_vector: UpVectorType,
    pub blend: BlendType,
    /// Begin position and, optionally, end position.
    pub positions: Vec<PositionFormula>,
    /// Size at the start and end of a particle's life.
    pub size: (f32, f32),
    pub size_x_curve: Vec<f32>,
    pub size_y_curve: Vec<f32>,
    pub textures: Vec<String>,
    pub frame_range: (i32, i32),
    pub stop_frame: Option<i32>,
    pub particle_count: u32,
    /// Particle lifetime range in frames; defaults to the object span.
    pub life: Option<(f32, f32)>,
    pub fade_in: f32,
    pub fade_out: f32,
    pub texture_anim_frame: u32,
    /// Degrees at begin/end of life, per X/Y/Z axis.
    pub rotation: [(f32, f32); 3],
    pub revolution: [(f32, f32); 3],
    pub curve_length: f32,
    /// Easing exponent for linear movement.
    pub move_curve: f32,
    /// Emitter cone half-angle in degrees.
    pub emit_angle: f32,
    /// Camera quake amplitude (pitch, yaw) in degrees.
    pub quake_amplitude: (f32, f32),
    /// Camera quake period in frames.
    pub quake_period: f32,
    /// Name of the model drawn by polygon objects.
    pub polygon: Option<String>,
    pub damage: Vec<i32>,
    pub texture_offset: (f32, f32),
}

impl ParticleObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParticleType::default(),
            move_type: MoveType::default(),
            up_vector: UpVectorType::default(),
            blend: BlendType::default(),
            positions: vec![PositionFormula::new(vec![PositionUnit::None])],
            size: (1.0, 1.0),
            size_x_curve: Vec::new(),
            size_y_curve: Vec::new(),
            textures: Vec::new(),
            frame_range: (0, 0),
            stop_frame: None,
            particle_count: 1,
            life: None,
            fade_in: 0.0,
            fade_out: 0.0,
            texture_anim_frame: 0,
            rotation: [(0.0, 0.0); 3],
            revolution: [(0.0, 0.0); 3],
            curve_length: 0.0,
            move_curve: 1.0,
            emit_angle: 30.0,
            quake_amplitude: (0.0, 0.0),
            quake_period: 10.0,
            polygon: None,
            damage: Vec::new(),
            texture_offset: (0.0, 0.0),
        }
    }

    pub fn begin_position(&self) -> &PositionFormula {
        &self.positions[0]
    }

    /// The end position falls back to the begin position.
    pub fn end_position(&self) -> &PositionFormula {
        self.positions.get(1).unwrap_or(&self.positions[0])
    }

    pub fn span(&self) -> f32 {
        (self.frame_range.1 - self.frame_range.0).max(0) as f32
    }
}
