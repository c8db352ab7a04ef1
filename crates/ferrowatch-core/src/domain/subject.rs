use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Kind of entity a cached fact is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectScope {
    User,
    Faction,
    Item,
}

impl SubjectScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Faction => "faction",
            Self::Item => "item",
        }
    }
}

/// Entity key rendered as `scope:id`, e.g. `user:42`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectKey {
    scope: SubjectScope,
    id: u64,
}

impl SubjectKey {
    pub const fn new(scope: SubjectScope, id: u64) -> Self {
        Self { scope, id }
    }

    pub const fn user(id: u64) -> Self {
        Self::new(SubjectScope::User, id)
    }

    pub const fn faction(id: u64) -> Self {
        Self::new(SubjectScope::Faction, id)
    }

    pub const fn item(id: u64) -> Self {
        Self::new(SubjectScope::Item, id)
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidSubjectKey {
            value: input.to_owned(),
        };

        let (scope, id) = input.trim().split_once(':').ok_or_else(invalid)?;
        let scope = match scope.to_ascii_lowercase().as_str() {
            "user" => SubjectScope::User,
            "faction" => SubjectScope::Faction,
            "item" => SubjectScope::Item,
            _ => return Err(invalid()),
        };
        let id = id.parse::<u64>().map_err(|_| invalid())?;

        Ok(Self { scope, id })
    }

    pub const fn scope(self) -> SubjectScope {
        self.scope
    }

    pub const fn id(self) -> u64 {
        self.id
    }
}

impl Display for SubjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope.as_str(), self.id)
    }
}

impl FromStr for SubjectKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SubjectKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubjectKey> for String {
    fn from(value: SubjectKey) -> Self {
        value.to_string()
    }
}

/// Closed set of tracked attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Ongoing course and its end time.
    Education,
    /// Locked-in investment and its maturity.
    Investment,
    Profile,
    /// Daily counter that saturates at a target.
    DailyTasks,
    /// Independent once-per-day refills.
    Refills,
    Chain,
    MarketPrice,
}

impl FieldKind {
    pub const ALL: [Self; 7] = [
        Self::Education,
        Self::Investment,
        Self::Profile,
        Self::DailyTasks,
        Self::Refills,
        Self::Chain,
        Self::MarketPrice,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Education => "education",
            Self::Investment => "investment",
            Self::Profile => "profile",
            Self::DailyTasks => "daily_tasks",
            Self::Refills => "refills",
            Self::Chain => "chain",
            Self::MarketPrice => "market_price",
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ValidationError::InvalidFieldKind {
                value: s.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_subject_keys() {
        let key = SubjectKey::parse(" Faction:9100 ").expect("key should parse");
        assert_eq!(key, SubjectKey::faction(9100));
        assert_eq!(key.to_string(), "faction:9100");
    }

    #[test]
    fn rejects_unknown_scope_and_bad_ids() {
        for input in ["company:1", "user", "user:-1", "user:abc"] {
            let err = SubjectKey::parse(input).expect_err("must fail");
            assert!(matches!(err, ValidationError::InvalidSubjectKey { .. }));
        }
    }

    #[test]
    fn field_kind_names_are_stable() {
        assert_eq!("daily_tasks".parse::<FieldKind>(), Ok(FieldKind::DailyTasks));
        assert_eq!(FieldKind::MarketPrice.to_string(), "market_price");
        assert!("weather".parse::<FieldKind>().is_err());
    }
}
