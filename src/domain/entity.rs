//! Entity kinds, parent references, and proposed-entity payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of real-estate entities the collectors discover
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Community,
    Builder,
    Property,
    SalesRep,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Community,
        EntityType::Builder,
        EntityType::Property,
        EntityType::SalesRep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Community => "community",
            Self::Builder => "builder",
            Self::Property => "property",
            Self::SalesRep => "sales_rep",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "community" => Ok(Self::Community),
            "builder" => Ok(Self::Builder),
            "property" => Ok(Self::Property),
            "sales_rep" => Ok(Self::SalesRep),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// Link from a job or change to its parent.
///
/// The parent is either a change that has not been reviewed yet, or an
/// entity that has already been committed. Approving a change rewrites every
/// `PendingChange` reference to it into a `CommittedEntity` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum ParentRef {
    PendingChange(Uuid),
    CommittedEntity(Uuid),
}

impl ParentRef {
    /// Storage tag for the `parent_kind` column
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PendingChange(_) => "pending_change",
            Self::CommittedEntity(_) => "committed_entity",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::PendingChange(id) | Self::CommittedEntity(id) => *id,
        }
    }

    /// Rebuild a reference from its stored columns
    pub fn from_parts(kind: Option<&str>, id: Option<Uuid>) -> Result<Option<Self>, String> {
        match (kind, id) {
            (None, None) => Ok(None),
            (Some("pending_change"), Some(id)) => Ok(Some(Self::PendingChange(id))),
            (Some("committed_entity"), Some(id)) => Ok(Some(Self::CommittedEntity(id))),
            (kind, id) => Err(format!("malformed parent reference: {:?}/{:?}", kind, id)),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingChange(_))
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Proposed community record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

/// Proposed builder record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Proposed property (home or lot) record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyData {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_feet: Option<u32>,
}

/// Proposed sales representative record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesRepData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Entity payload proposed by a collector, tagged by entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum ProposedData {
    Community(CommunityData),
    Builder(BuilderData),
    Property(PropertyData),
    SalesRep(SalesRepData),
}

impl ProposedData {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Community(_) => EntityType::Community,
            Self::Builder(_) => EntityType::Builder,
            Self::Property(_) => EntityType::Property,
            Self::SalesRep(_) => EntityType::SalesRep,
        }
    }

    /// Human-readable name used for the committed entity
    pub fn display_name(&self) -> &str {
        match self {
            Self::Community(d) => &d.name,
            Self::Builder(d) => &d.name,
            Self::Property(d) => &d.address,
            Self::SalesRep(d) => &d.name,
        }
    }

    /// Check the payload against its entity-type schema
    pub fn validate(&self) -> Result<(), String> {
        if self.display_name().trim().is_empty() {
            return Err(match self {
                Self::Property(_) => "property.address must not be empty".to_string(),
                other => format!("{}.name must not be empty", other.entity_type()),
            });
        }

        match self {
            Self::Community(d) => {
                if let Some(state) = &d.state {
                    if state.trim().len() != 2 {
                        return Err(format!(
                            "community.state must be a two-letter code, got '{}'",
                            state
                        ));
                    }
                }
            }
            Self::Builder(_) => {}
            Self::Property(d) => {
                if let Some(price) = d.price {
                    if !price.is_finite() || price < 0.0 {
                        return Err(format!("property.price is invalid: {}", price));
                    }
                }
                if let Some(baths) = d.bathrooms {
                    if !baths.is_finite() || baths < 0.0 {
                        return Err(format!("property.bathrooms is invalid: {}", baths));
                    }
                }
            }
            Self::SalesRep(d) => {
                if let Some(email) = &d.email {
                    if !email.contains('@') {
                        return Err(format!("sales_rep.email is invalid: '{}'", email));
                    }
                }
            }
        }

        Ok(())
    }
}

/// A committed entity record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub name: String,
    pub data: ProposedData,
    /// Committed parent entity, if the proposing change linked to one
    pub parent_id: Option<Uuid>,
    pub source_change_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_ref_serialization() {
        let id = Uuid::new_v4();
        let parent = ParentRef::PendingChange(id);

        let json = serde_json::to_value(parent).unwrap();
        assert_eq!(json["kind"], "PendingChange");
        assert_eq!(json["id"], id.to_string());

        let parsed: ParentRef = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, parent);
    }

    #[test]
    fn test_parent_ref_from_parts() {
        let id = Uuid::new_v4();
        assert_eq!(ParentRef::from_parts(None, None).unwrap(), None);
        assert_eq!(
            ParentRef::from_parts(Some("committed_entity"), Some(id)).unwrap(),
            Some(ParentRef::CommittedEntity(id))
        );
        assert!(ParentRef::from_parts(Some("pending_change"), None).is_err());
        assert!(ParentRef::from_parts(Some("bogus"), Some(id)).is_err());
    }

    #[test]
    fn test_proposed_data_tagging() {
        let json = r#"{"entity_type":"sales_rep","name":"Dana Ruiz","email":"dana@example.com"}"#;
        let data: ProposedData = serde_json::from_str(json).unwrap();

        assert_eq!(data.entity_type(), EntityType::SalesRep);
        assert_eq!(data.display_name(), "Dana Ruiz");
        assert!(data.validate().is_ok());
    }

    #[test]
    fn test_schema_validation() {
        let empty = ProposedData::Builder(BuilderData {
            name: "  ".to_string(),
            website: None,
            phone: None,
        });
        assert!(empty.validate().is_err());

        let bad_state = ProposedData::Community(CommunityData {
            name: "Cedar Hollow".to_string(),
            city: Some("Austin".to_string()),
            state: Some("Texas".to_string()),
            website: None,
        });
        assert!(bad_state.validate().unwrap_err().contains("two-letter"));

        let negative_price = ProposedData::Property(PropertyData {
            address: "12 Elm St".to_string(),
            price: Some(-1.0),
            bedrooms: None,
            bathrooms: None,
            square_feet: None,
        });
        assert!(negative_price.validate().is_err());
    }

    #[test]
    fn test_entity_type_round_trip_str() {
        for entity_type in EntityType::ALL {
            assert_eq!(entity_type.as_str().parse::<EntityType>().unwrap(), entity_type);
        }
        assert!("condo".parse::<EntityType>().is_err());
    }
}
