use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::record::{decode_field, FieldError, Record};

/// Incident identifier, assigned by the creating peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IncidentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which skills run an incident was recorded against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillsKind {
    Programming,
    Driver,
}

/// Where an incident happened: a league match or a skills attempt.
///
/// Only value-type references are carried — fat match data is recomputed by
/// the UI from the event metadata service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchRef {
    Match {
        division: u32,
        name: String,
        id: u64,
    },
    Skills {
        #[serde(rename = "skillsType")]
        skills_type: SkillsKind,
        attempt: u32,
    },
}

/// Severity/outcome of a recorded rule violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    General,
    Minor,
    Major,
    Disabled,
}

/// A rule-violation incident as recorded by a referee.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    /// Event SKU the incident belongs to. Immutable.
    pub sku: String,
    pub team: String,
    #[serde(rename = "match")]
    pub match_ref: Option<MatchRef>,
    pub outcome: Outcome,
    /// Rule codes, e.g. `<SG1>`. The core does not interpret them.
    pub rules: Vec<String>,
    pub notes: String,
    pub time: DateTime<Utc>,
    /// Opaque asset ids attached by the UI layer.
    pub assets: Vec<String>,
}

impl Record for Incident {
    const FIELDS: &'static [&'static str] =
        &["team", "match", "outcome", "rules", "notes", "time", "assets"];
    const IMMUTABLE: &'static [&'static str] = &["id", "sku"];

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(json!(self.id)),
            "sku" => Some(json!(self.sku)),
            "team" => Some(json!(self.team)),
            "match" => Some(json!(self.match_ref)),
            "outcome" => Some(json!(self.outcome)),
            "rules" => Some(json!(self.rules)),
            "notes" => Some(json!(self.notes)),
            "time" => Some(json!(self.time)),
            "assets" => Some(json!(self.assets)),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "team" => self.team = decode_field(name, value)?,
            "match" => self.match_ref = decode_field(name, value)?,
            "outcome" => self.outcome = decode_field(name, value)?,
            "rules" => self.rules = decode_field(name, value)?,
            "notes" => self.notes = decode_field(name, value)?,
            "time" => self.time = decode_field(name, value)?,
            "assets" => self.assets = decode_field(name, value)?,
            other => return Err(FieldError::UnknownField(other.to_owned())),
        }
        Ok(())
    }
}
