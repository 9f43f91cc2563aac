use std::fmt;

use serde::{Deserialize, Serialize};

pub const MINECRAFT_NAMESPACE: &str = "minecraft:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn block(&self) -> BlockPos {
        BlockPos::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorldType {
    #[default]
    Normal,
    Flat,
}

impl WorldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Flat => "FLAT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Some(Self::Normal),
            "FLAT" => Some(Self::Flat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorldEnvironment {
    #[default]
    Normal,
    Nether,
    TheEnd,
}

impl WorldEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Nether => "NETHER",
            Self::TheEnd => "THE_END",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Some(Self::Normal),
            "NETHER" => Some(Self::Nether),
            "THE_END" => Some(Self::TheEnd),
            _ => None,
        }
    }
}

/// One occupied slot of an open menu, as carried in `itemsJson`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItemSnapshot {
    pub slot: i32,
    pub material_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub lore: Vec<String>,
}

/// Lowercase namespaced key (`minecraft:stone`) for a raw material name or key.
pub fn normalize_material_key(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.contains(':') {
        trimmed
    } else {
        format!("{MINECRAFT_NAMESPACE}{trimmed}")
    }
}
