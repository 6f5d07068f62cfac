use glam::Vec3;

use super::lexer::{tokenize, Lexed, Token};
use super::types::{
    BlendType, MoveType, ParticleObject, ParticleType, PositionFormula, PositionUnit,
    UpVectorType, MAX_POSITION_UNITS,
};
use super::ScriptError;

const PARTICLE_TYPES: &[(&str, ParticleType)] = &[
    ("ビルボード", ParticleType::Billboard),
    ("ポリゴンオブジェクト", ParticleType::PolygonObject),
    ("剣ブラー", ParticleType::SwordBlur),
    ("カメラ振動", ParticleType::CameraQuake),
];

const MOVE_TYPES: &[(&str, MoveType)] = &[
    ("固定", MoveType::Fixed),
    ("直線", MoveType::Linear),
    ("発射", MoveType::Emitter),
];

const UP_VECTOR_TYPES: &[(&str, UpVectorType)] = &[
    ("Ｙ軸", UpVectorType::YAxis),
    ("Ｘ軸", UpVectorType::XAxis),
    ("Ｚ軸", UpVectorType::ZAxis),
    ("カメラ", UpVectorType::Camera),
];

const BLEND_TYPES: &[(&str, BlendType)] = &[("通常", BlendType::Normal), ("加算", BlendType::Additive)];

/// Parses a whole particle script into its object list.
pub fn parse_effect(source: &str) -> Result<Vec<ParticleObject>, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let mut objects = Vec::new();
    while !parser.at_end() {
        objects.push(parser.object()?);
    }
    Ok(objects)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Lexed>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|lexed| &lexed.token)
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        match self.tokens.get(self.pos) {
            Some(lexed) => ScriptError::new(self.source, lexed.offset, lexed.line, message),
            None => {
                let line = self.tokens.last().map_or(1, |lexed| lexed.line);
                ScriptError::new(self.source, self.source.len(), line, message)
            }
        }
    }

    fn unexpected(&self, wanted: &str) -> ScriptError {
        match self.peek() {
            Some(token) => self.error(format!("expected {wanted}, found {}", token.describe())),
            None => self.error(format!("expected {wanted}, found end of input")),
        }
    }

    fn expect(&mut self, wanted: Token) -> Result<(), ScriptError> {
        if self.peek() == Some(&wanted) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&wanted.describe()))
        }
    }

    fn eat(&mut self, wanted: &Token) -> bool {
        if self.peek() == Some(wanted) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn string(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Str(text)) => {
                let text = text.clone();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.unexpected("string")),
        }
    }

    fn number(&mut self) -> Result<f32, ScriptError> {
        match self.peek() {
            Some(Token::Number { value, .. }) => {
                let value = *value;
                self.pos += 1;
                Ok(value)
            }
            _ => Err(self.unexpected("number")),
        }
    }

    fn integer(&mut self) -> Result<i32, ScriptError> {
        match self.peek() {
            Some(Token::Number {
                value,
                integral: true,
            }) => {
                let value = *value as i32;
                self.pos += 1;
                Ok(value)
            }
            _ => Err(self.unexpected("integer")),
        }
    }

    fn enumerated<T: Copy>(&mut self, table: &[(&str, T)], what: &str) -> Result<T, ScriptError> {
        let found = match self.peek() {
            Some(Token::Ident(name)) => table
                .iter()
                .find(|(token, _)| token == name)
                .map(|(_, value)| *value),
            _ => None,
        };
        match found {
            Some(value) => {
                self.pos += 1;
                Ok(value)
            }
            None => Err(self.unexpected(what)),
        }
    }

    /// True when a comma is followed by a literal of the same kind, i.e.
    /// the comma continues a list instead of separating fields.
    fn list_continues(&self, strings: bool) -> bool {
        if self.peek() != Some(&Token::Comma) {
            return false;
        }
        match self.peek_at(1) {
            Some(Token::Number { .. }) => !strings,
            Some(Token::Str(_)) => strings,
            _ => false,
        }
    }

    fn float_list(&mut self) -> Result<Vec<f32>, ScriptError> {
        let mut values = vec![self.number()?];
        while self.list_continues(false) {
            self.pos += 1;
            values.push(self.number()?);
        }
        Ok(values)
    }

    fn int_list(&mut self) -> Result<Vec<i32>, ScriptError> {
        let mut values = vec![self.integer()?];
        while self.list_continues(false) {
            self.pos += 1;
            values.push(self.integer()?);
        }
        Ok(values)
    }

    fn string_list(&mut self) -> Result<Vec<String>, ScriptError> {
        let mut values = vec![self.string()?];
        while self.list_continues(true) {
            self.pos += 1;
            values.push(self.string()?);
        }
        Ok(values)
    }

    /// One value, or two comma-separated values. A single value fills both.
    fn float_pair(&mut self) -> Result<(f32, f32), ScriptError> {
        let first = self.number()?;
        if self.list_continues(false) {
            self.pos += 1;
            Ok((first, self.number()?))
        } else {
            Ok((first, first))
        }
    }

    fn int_pair(&mut self) -> Result<(i32, i32), ScriptError> {
        let first = self.integer()?;
        if self.list_continues(false) {
            self.pos += 1;
            Ok((first, self.integer()?))
        } else {
            Ok((first, first))
        }
    }

    fn non_negative_int(&mut self) -> Result<u32, ScriptError> {
        let value = self.integer()?;
        u32::try_from(value).map_err(|_| {
            self.pos -= 1;
            self.error(format!("expected a non-negative integer, found {value}"))
        })
    }

    fn object(&mut self) -> Result<ParticleObject, ScriptError> {
        match self.peek() {
            Some(Token::Ident(word)) if word == "object" => self.pos += 1,
            _ => return Err(self.unexpected("`object`")),
        }
        let name = self.string()?;
        self.expect(Token::Equals)?;
        self.expect(Token::LBrace)?;
        let mut object = ParticleObject::new(name);
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            self.field(&mut object)?;
            if self.eat(&Token::Comma) {
                continue;
            }
            if self.eat(&Token::RBrace) {
                break;
            }
            return Err(self.unexpected("`,` or `}`"));
        }
        Ok(object)
    }

    fn field(&mut self, object: &mut ParticleObject) -> Result<(), ScriptError> {
        let key_pos = self.pos;
        let key = self.ident()?;
        self.expect(Token::Equals)?;
        match key.as_str() {
            "種類" => object.kind = self.enumerated(PARTICLE_TYPES, "particle type")?,
            "移動タイプ" => object.move_type = self.enumerated(MOVE_TYPES, "move type")?,
            "上方向タイプ" => object.up_vector = self.enumerated(UP_VECTOR_TYPES, "up vector type")?,
            "ブレンドタイプ" => object.blend = self.enumerated(BLEND_TYPES, "blend type")?,
            "位置" => object.positions = self.position()?,
            "サイズ" => object.size = self.float_pair()?,
            "サイズＸ" => object.size_x_curve = self.float_list()?,
            "サイズＹ" => object.size_y_curve = self.float_list()?,
            "テクスチャ" => object.textures = self.string_list()?,
            "フレーム" => object.frame_range = self.int_pair()?,
            "ストップフレーム" => object.stop_frame = Some(self.integer()?),
            "パーティクル数" => object.particle_count = self.non_negative_int()?,
            "寿命" => object.life = Some(self.float_pair()?),
            "アルファフェードインフレーム" => object.fade_in = self.number()?,
            "アルファフェードアウトフレーム" => object.fade_out = self.number()?,
            "テクスチャアニメフレーム" => object.texture_anim_frame = self.non_negative_int()?,
            "回転Ｘ" => object.rotation[0] = self.float_pair()?,
            "回転Ｙ" => object.rotation[1] = self.float_pair()?,
            "回転Ｚ" => object.rotation[2] = self.float_pair()?,
            "公転Ｘ" => object.revolution[0] = self.float_pair()?,
            "公転Ｙ" => object.revolution[1] = self.float_pair()?,
            "公転Ｚ" => object.revolution[2] = self.float_pair()?,
            "曲線長" => object.curve_length = self.number()?,
            "移動曲線" => object.move_curve = self.number()?,
            "発射角度" => object.emit_angle = self.number()?,
            "振幅" => object.quake_amplitude = self.float_pair()?,
            "周期" => object.quake_period = self.number()?,
            "ポリゴン" => object.polygon = Some(self.string()?),
            "ダメージ" => object.damage = self.int_list()?,
            "オフセット" => object.texture_offset = self.float_pair()?,
            _ => {
                self.pos = key_pos;
                return Err(self.error(format!("unknown field `{key}`")));
            }
        }
        Ok(())
    }

    fn position(&mut self) -> Result<Vec<PositionFormula>, ScriptError> {
        self.expect(Token::LParen)?;
        let mut alternatives = vec![self.alternative()?];
        if self.eat(&Token::Comma) {
            alternatives.push(self.alternative()?);
        }
        self.expect(Token::RParen)?;
        Ok(alternatives)
    }

    fn alternative(&mut self) -> Result<PositionFormula, ScriptError> {
        let mut units = vec![self.unit()?];
        while self.peek() == Some(&Token::Plus) {
            if units.len() == MAX_POSITION_UNITS {
                return Err(self.error(format!(
                    "a position may chain at most {MAX_POSITION_UNITS} units"
                )));
            }
            self.pos += 1;
            units.push(self.unit()?);
        }
        Ok(PositionFormula::new(units))
    }

    fn vec3_args(&mut self) -> Result<Vec3, ScriptError> {
        let x = self.number()?;
        self.expect(Token::Comma)?;
        let y = self.number()?;
        self.expect(Token::Comma)?;
        let z = self.number()?;
        Ok(Vec3::new(x, y, z))
    }

    fn target_index(&mut self) -> Result<usize, ScriptError> {
        Ok(self.non_negative_int()? as usize)
    }

    fn unit(&mut self) -> Result<PositionUnit, ScriptError> {
        let start = self.pos;
        let name = self.ident()?;
        if name == "なし" {
            return Ok(PositionUnit::None);
        }
        self.expect(Token::LParen)?;
        let unit = match name.as_str() {
            "絶対" => PositionUnit::Absolute(self.vec3_args()?),
            "ボーン" => {
                let target = self.target_index()?;
                self.expect(Token::Comma)?;
                let bone = self.string()?;
                self.expect(Token::Comma)?;
                let offset = self.vec3_args()?;
                PositionUnit::Bone {
                    target,
                    bone,
                    offset,
                }
            }
            "ターゲット" => {
                let target = self.target_index()?;
                self.expect(Token::Comma)?;
                let offset = self.vec3_args()?;
                PositionUnit::Target { target, offset }
            }
            "乱数" => PositionUnit::Random(self.number()?),
            "乱数正Ｙ" => PositionUnit::RandomPositiveY(self.number()?),
            _ => {
                self.pos = start;
                return Err(self.error(format!("unknown position unit `{name}`")));
            }
        };
        self.expect(Token::RParen)?;
        Ok(unit)
    }
}
