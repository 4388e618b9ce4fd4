use std::fmt;
use std::str::FromStr;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    #[sea_orm(string_value = "PROVISIONING")]
    Provisioning,
    #[sea_orm(string_value = "ACTIVE")]
    Active,
    #[sea_orm(string_value = "TRIAL")]
    Trial,
    #[sea_orm(string_value = "SUSPENDED")]
    Suspended,
    #[sea_orm(string_value = "ARCHIVED")]
    Archived,
}

impl TenantStatus {
    pub const ALL: [TenantStatus; 5] = [
        TenantStatus::Provisioning,
        TenantStatus::Active,
        TenantStatus::Trial,
        TenantStatus::Suspended,
        TenantStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TenantStatus::Provisioning => "PROVISIONING",
            TenantStatus::Active => "ACTIVE",
            TenantStatus::Trial => "TRIAL",
            TenantStatus::Suspended => "SUSPENDED",
            TenantStatus::Archived => "ARCHIVED",
        }
    }

    /// Whether new connections to the tenant's store may be opened.
    pub fn accepts_connections(self) -> bool {
        !matches!(self, TenantStatus::Suspended | TenantStatus::Archived)
    }

    /// Allowed-transition table. ARCHIVED is terminal and PROVISIONING only
    /// moves forward to ACTIVE.
    pub fn can_transition_to(self, next: TenantStatus) -> bool {
        use TenantStatus::*;
        matches!(
            (self, next),
            (Provisioning, Active)
                | (Active, Trial | Suspended | Archived)
                | (Trial, Active | Suspended | Archived)
                | (Suspended, Active | Archived)
        )
    }

    /// Entering these states asks the pool manager to drain the tenant's pool.
    pub fn requires_drain(self) -> bool {
        !self.accepts_connections()
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        TenantStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("unknown tenant status '{s}'"))
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub display_name: String,
    pub status: TenantStatus,
    #[sea_orm(unique)]
    pub database_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::TenantStatus::*;
    use super::*;

    #[test]
    fn archived_is_terminal() {
        for next in TenantStatus::ALL {
            assert!(!Archived.can_transition_to(next));
        }
    }

    #[test]
    fn provisioning_only_activates() {
        let allowed: Vec<_> = TenantStatus::ALL
            .into_iter()
            .filter(|next| Provisioning.can_transition_to(*next))
            .collect();
        assert_eq!(allowed, vec![Active]);
    }

    #[test]
    fn suspended_and_archived_refuse_connections() {
        assert!(Provisioning.accepts_connections());
        assert!(Trial.accepts_connections());
        assert!(!Suspended.accepts_connections());
        assert!(Archived.requires_drain());
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("suspended".parse::<TenantStatus>().unwrap(), Suspended);
        assert_eq!(" Trial ".parse::<TenantStatus>().unwrap(), Trial);
        assert!("deleted".parse::<TenantStatus>().is_err());
    }
}
