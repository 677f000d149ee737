use core::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::record::{decode_field, FieldError, Record};

/// Scratchpad identifier, derived deterministically from the match it
/// annotates so every referee lands on the same id without coordination.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScratchpadId(String);

impl ScratchpadId {
    /// Derive the id for `(sku, division, match-name)`.
    pub fn derive(sku: &str, division: u32, match_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sku.as_bytes());
        hasher.update(b"|");
        hasher.update(division.to_le_bytes());
        hasher.update(b"|");
        hasher.update(match_name.as_bytes());
        let digest = hasher.finalize();

        Self(URL_SAFE_NO_PAD.encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScratchpadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ScratchpadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Autonomous win point flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwpFlags {
    pub red: bool,
    pub blue: bool,
}

/// Autonomous period winner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoWinner {
    #[default]
    None,
    Red,
    Blue,
    Tie,
}

/// Per-match referee annotations, shared between head referees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scratchpad {
    pub id: ScratchpadId,
    /// Event SKU. Immutable.
    pub sku: String,
    /// Which game's field set applies, e.g. `"High Stakes"`.
    pub game: String,
    pub awp: AwpFlags,
    pub auto: AutoWinner,
    pub notes: String,
}

impl Record for Scratchpad {
    const FIELDS: &'static [&'static str] = &["game", "awp", "auto", "notes"];
    const IMMUTABLE: &'static [&'static str] = &["id", "sku"];

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(json!(self.id)),
            "sku" => Some(json!(self.sku)),
            "game" => Some(json!(self.game)),
            "awp" => Some(json!(self.awp)),
            "auto" => Some(json!(self.auto)),
            "notes" => Some(json!(self.notes)),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "game" => self.game = decode_field(name, value)?,
            "awp" => self.awp = decode_field(name, value)?,
            "auto" => self.auto = decode_field(name, value)?,
            "notes" => self.notes = decode_field(name, value)?,
            other => return Err(FieldError::UnknownField(other.to_owned())),
        }
        Ok(())
    }
}
