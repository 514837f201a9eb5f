//! Material registry: maps compact [`MaterialId`] values to [`MaterialDef`] metadata.
//!
//! Air is always ID 0 so that zero-initialized cells represent empty space.
//! Unknown IDs resolve to air rather than panicking; a block store may hold
//! ids persisted by a newer build.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest light level and opacity a material may declare.
pub const MAX_LIGHT_LEVEL: u8 = 15;

/// Compact identifier stored in the high half of every block cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaterialId(pub u16);

impl MaterialId {
    /// The air material.
    pub const AIR: MaterialId = MaterialId(0);
}

/// Full descriptor for a block material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDef {
    /// Human-readable name (e.g. "stone", "glowstone").
    pub name: String,
    /// Whether entities collide with this material.
    pub solid: bool,
    /// How much sky light is absorbed passing through (0 = clear, 15 = opaque).
    pub opacity: u8,
    /// Block light emitted by this material (0 = none, 15 = max).
    pub light_emission: u8,
}

impl MaterialDef {
    /// A solid material that absorbs all light.
    pub fn opaque(name: &str) -> Self {
        Self {
            name: name.to_string(),
            solid: true,
            opacity: MAX_LIGHT_LEVEL,
            light_emission: 0,
        }
    }

    /// A non-solid material that lets light through untouched.
    pub fn clear(name: &str) -> Self {
        Self {
            name: name.to_string(),
            solid: false,
            opacity: 0,
            light_emission: 0,
        }
    }
}

/// Errors that can occur during material registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A material with the same name has already been registered.
    #[error("duplicate material name: {0}")]
    DuplicateName(String),
    /// All 65 536 slots have been consumed.
    #[error("material registry is full (max 65536 materials)")]
    RegistryFull,
    /// Opacity or emission above [`MAX_LIGHT_LEVEL`].
    #[error("material {name} declares light value {value} above 15")]
    LightOutOfRange {
        /// Offending material.
        name: String,
        /// Offending value.
        value: u8,
    },
}

/// Maps [`MaterialId`] → [`MaterialDef`] with O(1) lookup by index and
/// O(1) reverse lookup by name.
#[derive(Debug)]
pub struct MaterialRegistry {
    /// Dense array where `index == MaterialId.0`.
    materials: Vec<MaterialDef>,
    name_to_id: HashMap<String, MaterialId>,
}

impl MaterialRegistry {
    /// Creates a new registry with air pre-registered as ID 0.
    pub fn new() -> Self {
        let mut name_to_id = HashMap::new();
        name_to_id.insert("air".to_string(), MaterialId::AIR);
        Self {
            materials: vec![MaterialDef::clear("air")],
            name_to_id,
        }
    }

    /// Registers a new material and returns its assigned ID.
    ///
    /// IDs are assigned sequentially starting from 1.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for a duplicate name, a full registry, or a
    /// light value above 15.
    pub fn register(&mut self, def: MaterialDef) -> Result<MaterialId, RegistryError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        if self.materials.len() > u16::MAX as usize {
            return Err(RegistryError::RegistryFull);
        }
        for value in [def.opacity, def.light_emission] {
            if value > MAX_LIGHT_LEVEL {
                return Err(RegistryError::LightOutOfRange {
                    name: def.name,
                    value,
                });
            }
        }

        let id = MaterialId(self.materials.len() as u16);
        self.name_to_id.insert(def.name.clone(), id);
        self.materials.push(def);
        Ok(id)
    }

    /// Returns the definition for `id`, or air if the id is unknown.
    pub fn get(&self, id: MaterialId) -> &MaterialDef {
        self.materials
            .get(id.0 as usize)
            .unwrap_or(&self.materials[0])
    }

    /// Returns the ID for a named material, or `None` if not found.
    pub fn lookup_by_name(&self, name: &str) -> Option<MaterialId> {
        self.name_to_id.get(name).copied()
    }

    /// Opacity of `id` (0 for unknown ids).
    pub fn opacity(&self, id: MaterialId) -> u8 {
        self.get(id).opacity
    }

    /// Light emission of `id` (0 for unknown ids).
    pub fn light_emission(&self, id: MaterialId) -> u8 {
        self.get(id).light_emission
    }

    /// Returns the total number of registered materials (including air).
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// Returns `true` if only air is registered.
    pub fn is_empty(&self) -> bool {
        self.materials.len() <= 1
    }
}

impl Default for MaterialRegistry {
    fn default() -> Self {
        Self::new()
    }
}
