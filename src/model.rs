//! Core entities: apps, deployments, env vars, users and their plans.
//!
//! Status enums mirror the persistence-layer idiom of storing a small,
//! `strum`-derived enum as text and converting it at the wire boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status shared by an app and its most recent deployment.
///
/// An app's status is always the projection of its latest deployment's
/// status (see DESIGN.md — "dual status columns" resolution); this type
/// is reused for both so that projection is a type-level fact, not a
/// convention two separate enums have to agree on.
#[derive(
    sqlx::Type, Debug, Default, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Building,
    Running,
    Failed,
    Stopped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Failed | Status::Stopped)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Status::Pending | Status::Building)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub slug: String,
    pub repo_url: String,
    pub branch: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    pub fn url(&self, base_domain: &str) -> String {
        format!("https://{}.{}", self.slug, base_domain)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub app_id: String,
    pub status: Status,
    pub image_ref: Option<String>,
    pub container_ref: Option<String>,
    pub subdomain: Option<String>,
    pub build_log: Option<String>,
    pub runtime_log: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct EnvVar {
    pub app_id: String,
    pub key: String,
    pub value: String,
}

#[derive(
    sqlx::Type, Debug, Default, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Starter,
    Pro,
    Team,
    Custom,
}

/// Read-only limits a plan places on the Quota Gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_apps: u32,
    pub max_ram_mb: u32,
    pub max_disk_gb: u32,
    pub runtime_logs: bool,
}

impl Plan {
    /// A static table, overridable in full by `Config::default_plan_limits`
    /// for the `Custom` plan (every other plan is a fixed tier).
    pub fn limits(self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                max_apps: 1,
                max_ram_mb: 256,
                max_disk_gb: 1,
                runtime_logs: false,
            },
            Plan::Starter => PlanLimits {
                max_apps: 3,
                max_ram_mb: 512,
                max_disk_gb: 2,
                runtime_logs: true,
            },
            Plan::Pro => PlanLimits {
                max_apps: 10,
                max_ram_mb: 2048,
                max_disk_gb: 10,
                runtime_logs: true,
            },
            Plan::Team => PlanLimits {
                max_apps: 50,
                max_ram_mb: 4096,
                max_disk_gb: 20,
                runtime_logs: true,
            },
            Plan::Custom => PlanLimits {
                max_apps: u32::MAX,
                max_ram_mb: u32::MAX,
                max_disk_gb: u32::MAX,
                runtime_logs: true,
            },
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub plan: Plan,
}

/// DNS-safe slug derived from an app name: lowercase, ASCII alphanumerics
/// and hyphens only, collapsed and trimmed. Stable for the app's lifetime
/// once assigned.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_hyphen = false;
    for ch in name.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_hyphen = false;
        } else if !last_was_hyphen && !slug.is_empty() {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("app");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_strips_non_dns_chars() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  leading   spaces"), "leading-spaces");
        assert_eq!(slugify("___"), "app");
        assert_eq!(slugify("my_cool_app-42"), "my-cool-app-42");
    }

    #[test]
    fn status_roundtrips_through_display_and_from_str() {
        use std::str::FromStr;
        assert_eq!(Status::Building, Status::from_str("BUILDING").unwrap());
        assert_eq!(Status::Pending.to_string(), "Pending");
    }

    #[test]
    fn status_in_flight_and_terminal_are_disjoint() {
        for s in [
            Status::Pending,
            Status::Building,
            Status::Running,
            Status::Failed,
            Status::Stopped,
        ] {
            assert!(!(s.is_in_flight() && s.is_terminal()));
        }
    }
}
