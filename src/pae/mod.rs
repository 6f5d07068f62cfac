//! Particle-effect scripts (`.pae`).
//!
//! A script is a flat list of declarative objects:
//!
//! ```text
//! object "spark" = {
//!     種類 = ビルボード,
//!     移動タイプ = 直線,
//!     位置 = (ボーン(0, "右手", 0, 0.1, 0) , 乱数(0.5) + ターゲット(1, 0, 1, 0)),
//!     サイズ = 0.5, 1.5,
//!     テクスチャ = "spark1.bmp", "spark2.bmp",
//!     フレーム = 0, 30,
//! }
//! ```
//!
//! Parsing only builds the typed object list; position formulas are
//! evaluated later by the particle simulator.

mod lexer;
mod parser;
mod types;

use thiserror::Error;

pub use parser::parse_effect;
pub use types::{
    BlendType, MoveType, ParticleObject, ParticleType, PositionFormula, PositionUnit,
    UpVectorType, MAX_POSITION_UNITS,
};

/// Hard failure while reading a particle script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message} (near `{context}`)")]
pub struct ScriptError {
    pub line: usize,
    pub message: String,
    /// The unparsed input starting at the offending token, truncated.
    pub context: String,
}

const CONTEXT_CHARS: usize = 40;

impl ScriptError {
    pub(crate) fn new(source: &str, offset: usize, line: usize, message: impl Into<String>) -> Self {
        let rest = source.get(offset..).unwrap_or("");
        let context: String = rest.chars().take(CONTEXT_CHARS).collect();
        Self {
            line,
            message: message.into(),
            context: context.replace('\n', " "),
        }
    }
}
