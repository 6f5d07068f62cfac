use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::effect::ParticleEffect;
use super::model::Model;
use super::texture::Texture;
use crate::animation::Motion;
use crate::archive::{normalize_name, Archive};
use crate::error::LoadError;
use crate::formats::{Amt, Mot, Pol};
use crate::pae::parse_effect;

/// Loads assets through an [`Archive`] and shares them by path.
///
/// Loading the same path twice returns the same `Arc`. Motions are never
/// cached since every instance owns its own playback state.
pub struct AssetCache {
    archive: Arc<dyn Archive>,
    models: Mutex<HashMap<String, Arc<Model>>>,
    textures: Mutex<HashMap<String, Arc<Texture>>>,
    effects: Mutex<HashMap<String, Arc<ParticleEffect>>>,
}

impl AssetCache {
    pub fn new(archive: Arc<dyn Archive>) -> Self {
        Self {
            archive,
            models: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
            effects: Mutex::new(HashMap::new()),
        }
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, LoadError> {
        self.archive
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }

    /// Loads `<path>/<basename>.POL` and the optional `.amt` beside it.
    pub fn load_model(&self, path: &str) -> Result<Arc<Model>, LoadError> {
        let key = normalize_name(path);
        if let Some(model) = self.models.lock().get(&key) {
            return Ok(Arc::clone(model));
        }

        let base = basename(&key);
        let pol_name = format!("{key}/{base}.POL");
        let bytes = self.read(&pol_name)?;
        let pol = Pol::parse(&bytes).map_err(|source| {
            warn!("{pol_name}: {source}");
            LoadError::Parse {
                path: pol_name.clone(),
                source,
            }
        })?;

        let amt_name = format!("{key}/{base}.amt");
        let amt = match self.archive.get(&amt_name) {
            Some(bytes) => match Amt::parse(&bytes) {
                Ok(amt) => Some(amt),
                Err(err) => {
                    warn!("{amt_name}: {err}; using default material parameters");
                    None
                }
            },
            None => None,
        };

        let mut load_texture = |file: &str| self.load_texture(&format!("{key}/{file}"));
        let model = Model::build(&key, &key, pol, amt.as_ref(), &mut load_texture).map_err(|err| {
            if err.is_structural() {
                error!("{key}: {err}");
            } else {
                warn!("{key}: {err}");
            }
            err
        })?;
        info!(
            "loaded model {key}: {} meshes, {} materials, {} bones",
            model.meshes.len(),
            model.materials.len(),
            model.bones.len()
        );

        let mut models = self.models.lock();
        let model = models.entry(key).or_insert_with(|| Arc::new(model));
        Ok(Arc::clone(model))
    }

    /// Loads `<model dir>/<name>.MOT` bound to `model`'s skeleton.
    pub fn load_motion(&self, model: &Model, name: &str) -> Result<Motion, LoadError> {
        let mot_name = normalize_name(&format!("{}/{name}.MOT", model.dir));
        let bytes = self.read(&mot_name)?;
        let mot = Mot::parse(&bytes).map_err(|source| {
            warn!("{mot_name}: {source}");
            LoadError::Parse {
                path: mot_name.clone(),
                source,
            }
        })?;
        Motion::bind(name, mot, model).map_err(|err| {
            error!("{mot_name}: {err}");
            err
        })
    }

    /// Loads `<path>/<basename>.pae` with its textures and sub-models.
    pub fn load_particle_effect(&self, path: &str) -> Result<Arc<ParticleEffect>, LoadError> {
        let key = normalize_name(path);
        if let Some(effect) = self.effects.lock().get(&key) {
            return Ok(Arc::clone(effect));
        }

        let script_name = format!("{key}/{}.pae", basename(&key));
        let bytes = self.read(&script_name)?;
        let source = String::from_utf8_lossy(&bytes);
        let objects = parse_effect(&source).map_err(|source| {
            warn!("{script_name}: {source}");
            LoadError::Script {
                path: script_name.clone(),
                source,
            }
        })?;

        let mut textures = HashMap::new();
        let mut models = HashMap::new();
        for object in &objects {
            for file in &object.textures {
                if !textures.contains_key(file) {
                    let texture = self.load_texture(&format!("{key}/{file}"))?;
                    textures.insert(file.clone(), texture);
                }
            }
            if let Some(polygon) = &object.polygon {
                if !models.contains_key(polygon) {
                    let model = self.load_model(&format!("{key}/{polygon}"))?;
                    models.insert(polygon.clone(), model);
                }
            }
        }
        info!(
            "loaded particle effect {key}: {} objects, {} textures, {} models",
            objects.len(),
            textures.len(),
            models.len()
        );

        let effect = ParticleEffect {
            path: key.clone(),
            objects,
            textures,
            models,
        };
        let mut effects = self.effects.lock();
        let effect = effects.entry(key).or_insert_with(|| Arc::new(effect));
        Ok(Arc::clone(effect))
    }

    pub fn load_texture(&self, path: &str) -> Result<Arc<Texture>, LoadError> {
        let key = normalize_name(path);
        if let Some(texture) = self.textures.lock().get(&key) {
            return Ok(Arc::clone(texture));
        }
        let bytes = self.read(&key)?;
        let texture = Texture::decode(&key, &bytes)?;
        debug!("decoded {key} ({}x{})", texture.width, texture.height);
        let mut textures = self.textures.lock();
        let texture = textures.entry(key).or_insert_with(|| Arc::new(texture));
        Ok(Arc::clone(texture))
    }

    /// Loads the numbered background CG `index`.
    pub fn load_background(&self, index: u32) -> Result<Arc<Texture>, LoadError> {
        let key = format!("#cg/{index}");
        if let Some(texture) = self.textures.lock().get(&key) {
            return Ok(Arc::clone(texture));
        }
        let bytes = self
            .archive
            .get_numbered(index)
            .ok_or_else(|| LoadError::NotFound(key.clone()))?;
        let texture = Texture::decode(&key, &bytes)?;
        let mut textures = self.textures.lock();
        let texture = textures.entry(key).or_insert_with(|| Arc::new(texture));
        Ok(Arc::clone(texture))
    }

    pub fn model_count(&self) -> usize {
        self.models.lock().len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.lock().len()
    }

    pub fn effect_count(&self) -> usize {
        self.effects.lock().len()
    }

    /// Drops every cached asset. Instances keep their own references.
    pub fn clear(&self) {
        self.models.lock().clear();
        self.textures.lock().clear();
        self.effects.lock().clear();
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
