//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Persistence abstractions and storage bindings."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a persisted management-plane object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// Entity (applications are entities without a parent).
    Entity,
    /// Location.
    Location,
    /// Policy adjunct.
    Policy,
    /// Enricher adjunct.
    Enricher,
    /// Feed adjunct.
    Feed,
    /// Catalog item.
    CatalogItem,
}

impl ObjectKind {
    /// Every category, in the order tables are reported.
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::Entity,
        ObjectKind::Location,
        ObjectKind::Policy,
        ObjectKind::Enricher,
        ObjectKind::Feed,
        ObjectKind::CatalogItem,
    ];

    /// Policies, enrichers, and feeds are owned by exactly one entity.
    pub fn is_adjunct(&self) -> bool {
        matches!(self, ObjectKind::Policy | ObjectKind::Enricher | ObjectKind::Feed)
    }

    /// Lower-case identifier, also used in `$ref` markers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Entity => "entity",
            ObjectKind::Location => "location",
            ObjectKind::Policy => "policy",
            ObjectKind::Enricher => "enricher",
            ObjectKind::Feed => "feed",
            ObjectKind::CatalogItem => "catalog-item",
        }
    }

    /// Human-readable name used in error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ObjectKind::Entity => "Entity",
            ObjectKind::Location => "Location",
            ObjectKind::Policy => "Policy",
            ObjectKind::Enricher => "Enricher",
            ObjectKind::Feed => "Feed",
            ObjectKind::CatalogItem => "CatalogItem",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ObjectKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.display_name() == s)
            .ok_or_else(|| format!("unknown object kind: {}", s))
    }
}
