use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::watermark::WatermarkOptions;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "videos")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    #[serde(skip_deserializing)]
    pub id: Uuid,
    pub title: String,
    pub teacher_id: i32,
    pub raw_file_path: String,
    pub processed_file_path: Option<String>,
    pub status: String,
    pub retry_count: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub watermark_options: Json,
    #[sea_orm(column_type = "JsonBinary")]
    pub security_options: Json,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Stored overlay settings, falling back to defaults for malformed rows.
    pub fn watermark_options(&self) -> WatermarkOptions {
        serde_json::from_value(self.watermark_options.clone()).unwrap_or_default()
    }

    pub fn security_options(&self) -> SecurityOptions {
        serde_json::from_value(self.security_options.clone()).unwrap_or_default()
    }
}

/// Lifecycle of a video row. Stored as the upper-case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    Pending,
    Processing,
    Retrying,
    Processed,
    Failed,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Retrying => "RETRYING",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "RETRYING" => Some(Self::Retrying),
            "PROCESSED" => Some(Self::Processed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Playback restrictions the teacher attached to a video.
///
/// `prevent_screen_capture` and `prevent_download` are advisory and only shape
/// the embed snippet; `restrict_ip_access` is enforced on playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub prevent_screen_capture: bool,
    pub prevent_download: bool,
    pub restrict_ip_access: bool,
    pub allowed_ips: Vec<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            prevent_screen_capture: true,
            prevent_download: true,
            restrict_ip_access: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl SecurityOptions {
    /// Entries that are not valid IP addresses never match.
    pub fn allows_ip(&self, ip: Option<std::net::IpAddr>) -> bool {
        if !self.restrict_ip_access {
            return true;
        }
        match ip {
            Some(ip) => self
                .allowed_ips
                .iter()
                .filter_map(|allowed| allowed.trim().parse::<std::net::IpAddr>().ok())
                .any(|allowed| allowed == ip),
            None => false,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::TeacherId",
        to = "super::user::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_restriction_only_applies_when_enabled() {
        let open = SecurityOptions::default();
        assert!(open.allows_ip(None));

        let restricted = SecurityOptions {
            restrict_ip_access: true,
            allowed_ips: vec!["10.0.0.5".to_string()],
            ..Default::default()
        };
        let ip = |s: &str| s.parse::<std::net::IpAddr>().ok();
        assert!(restricted.allows_ip(ip("10.0.0.5")));
        assert!(!restricted.allows_ip(ip("10.0.0.6")));
        assert!(!restricted.allows_ip(None));
    }

    #[test]
    fn status_strings_match_stored_values() {
        assert_eq!(VideoStatus::Processed.as_str(), "PROCESSED");
        assert_eq!(VideoStatus::Retrying.to_string(), "RETRYING");
    }

    #[test]
    fn teacher_relation_cascades_like_the_table() {
        let def = Relation::User.def();
        assert_eq!(def.on_update, Some(sea_orm::sea_query::ForeignKeyAction::Cascade));
        assert_eq!(def.on_delete, Some(sea_orm::sea_query::ForeignKeyAction::Cascade));
    }
}
