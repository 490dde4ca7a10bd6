use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    /// Display order; the backend returns stages sorted by `position`.
    #[serde(default)]
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn stage(&self, stage_id: i64) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn contains_stage(&self, stage_id: i64) -> bool {
        self.stage(stage_id).is_some()
    }

    /// Stages sorted by position, ties broken by id so the order is total.
    pub fn ordered_stages(&self) -> Vec<&Stage> {
        let mut stages: Vec<&Stage> = self.stages.iter().collect();
        stages.sort_by_key(|s| (s.position, s.id));
        stages
    }

    /// True when no two stages share a position.
    pub fn has_strict_stage_order(&self) -> bool {
        let mut positions: Vec<i32> = self.stages.iter().map(|s| s.position).collect();
        positions.sort_unstable();
        positions.windows(2).all(|w| w[0] != w[1])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: i64,
    pub name: String,
    pub pipeline_id: i64,
    pub position: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    #[default]
    Active,
    Won,
    Lost,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            _ => Err(format!("Invalid deal status: {}", s)),
        }
    }
}

/// Value of a user-defined deal field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CustomValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Date(NaiveDate),
}

impl CustomValue {
    /// Type a raw form value: boolean, then number, then ISO date, else string.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(b) = trimmed.parse::<bool>() {
            return Self::Boolean(b);
        }
        if let Ok(n) = trimmed.parse::<f64>()
            && n.is_finite()
        {
            return Self::Number(n);
        }
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Self::Date(d);
        }
        Self::String(raw.to_string())
    }
}

impl std::fmt::Display for CustomValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CustomValue::String(s) => write!(f, "{}", s),
            CustomValue::Number(n) => write!(f, "{}", n),
            CustomValue::Boolean(b) => write!(f, "{}", b),
            CustomValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

pub type CustomFields = BTreeMap<String, CustomValue>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotionSync {
    pub page_id: Option<String>,
    pub database_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: i64,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub status: DealStatus,
    pub stage_id: i64,
    pub pipeline_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub custom_fields: CustomFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notion: Option<NotionSync>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn has_tag(&self, tag_id: i64) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }

    /// Collapse duplicate tags (by id). The association is a set, so the
    /// resulting order carries no meaning beyond being stable.
    pub fn dedup_tags(&mut self) {
        self.tags.sort_by_key(|t| t.id);
        self.tags.dedup_by_key(|t| t.id);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

/// Account record. The Notion access token stays on the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub notion_user_id: Option<String>,
    pub notion_workspace_id: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewPipeline {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<String>,
}

/// One entry of a stage list replacement. Entries without an id are created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageInput>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewDeal {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub status: DealStatus,
    pub stage_id: i64,
    pub pipeline_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub custom_fields: CustomFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DealUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DealStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    /// Absent leaves the date alone; `null` clears it.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub expected_close_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<CustomFields>,
}

/// Wrap any present value, `null` included, so it differs from absence.
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl DealUpdate {
    pub fn move_to(stage_id: i64, position: i32) -> Self {
        Self {
            stage_id: Some(stage_id),
            position: Some(position),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTag {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn stage(id: i64, position: i32) -> Stage {
        Stage {
            id,
            name: format!("S{}", id),
            pipeline_id: 1,
            position,
            deal_count: None,
            deal_value: None,
        }
    }

    #[test]
    fn test_deal_status_roundtrips_through_str() {
        for status in [DealStatus::Active, DealStatus::Won, DealStatus::Lost] {
            assert_eq!(DealStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(DealStatus::from_str("archived").is_err());
    }

    #[test]
    fn test_custom_value_wire_shape_is_tagged() {
        let v = serde_json::to_value(CustomValue::Number(12.5)).unwrap();
        assert_eq!(v, serde_json::json!({"type": "number", "value": 12.5}));

        let d: CustomValue =
            serde_json::from_value(serde_json::json!({"type": "date", "value": "2024-05-01"}))
                .unwrap();
        assert_eq!(
            d,
            CustomValue::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
        );
    }

    #[test]
    fn test_custom_value_rejects_untagged_input() {
        let result: Result<CustomValue, _> = serde_json::from_value(serde_json::json!(42));
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_value_infer_order() {
        assert_eq!(CustomValue::infer("true"), CustomValue::Boolean(true));
        assert_eq!(CustomValue::infer("1200"), CustomValue::Number(1200.0));
        assert_eq!(
            CustomValue::infer("2024-12-31"),
            CustomValue::Date(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
        );
        assert_eq!(
            CustomValue::infer("enterprise"),
            CustomValue::String("enterprise".into())
        );
        assert_eq!(CustomValue::infer("NaN"), CustomValue::String("NaN".into()));
    }

    #[test]
    fn test_deal_update_close_date_absent_null_or_set() {
        let absent: DealUpdate = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(absent.expected_close_date, None);

        let cleared: DealUpdate =
            serde_json::from_value(serde_json::json!({"expectedCloseDate": null})).unwrap();
        assert_eq!(cleared.expected_close_date, Some(None));

        let set: DealUpdate =
            serde_json::from_value(serde_json::json!({"expectedCloseDate": "2025-01-31"}))
                .unwrap();
        assert_eq!(
            set.expected_close_date,
            Some(NaiveDate::from_ymd_opt(2025, 1, 31))
        );

        let wire = serde_json::to_value(&cleared).unwrap();
        assert_eq!(wire, serde_json::json!({"expectedCloseDate": null}));
        assert_eq!(
            serde_json::to_value(&absent).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn test_deal_deserializes_camel_case_with_defaults() {
        let json = serde_json::json!({
            "id": 7,
            "name": "Acme renewal",
            "value": 5000.0,
            "stageId": 2,
            "pipelineId": 1,
            "userId": 3,
            "createdAt": "2024-03-01T10:00:00Z",
            "updatedAt": "2024-03-01T10:00:00Z"
        });
        let deal: Deal = serde_json::from_value(json).unwrap();
        assert_eq!(deal.status, DealStatus::Active);
        assert_eq!(deal.position, 0);
        assert!(deal.custom_fields.is_empty());
        assert!(deal.notion.is_none());
    }

    #[test]
    fn test_pipeline_stage_order() {
        let pipeline = Pipeline {
            id: 1,
            name: "Sales".into(),
            stages: vec![stage(10, 2), stage(11, 0), stage(12, 1)],
            created_at: ts(),
            updated_at: ts(),
        };
        let order: Vec<i64> = pipeline.ordered_stages().iter().map(|s| s.id).collect();
        assert_eq!(order, vec![11, 12, 10]);
        assert!(pipeline.has_strict_stage_order());
        assert!(pipeline.contains_stage(12));
        assert!(!pipeline.contains_stage(99));

        let dup = Pipeline {
            stages: vec![stage(10, 0), stage(11, 0)],
            ..pipeline
        };
        assert!(!dup.has_strict_stage_order());
    }

    #[test]
    fn test_contact_dedup_tags() {
        let tag = |id| Tag {
            id,
            name: format!("t{}", id),
            color: "#112233".into(),
            created_at: ts(),
        };
        let mut contact = Contact {
            id: 1,
            name: "Ada".into(),
            email: None,
            phone: None,
            company: None,
            tags: vec![tag(2), tag(1), tag(2)],
            created_at: ts(),
            updated_at: ts(),
        };
        contact.dedup_tags();
        assert_eq!(contact.tags.len(), 2);
        assert!(contact.has_tag(1));
        assert!(contact.has_tag(2));
    }

    #[test]
    fn test_deal_update_skips_unset_fields() {
        let v = serde_json::to_value(DealUpdate::move_to(4, 1)).unwrap();
        assert_eq!(v, serde_json::json!({"stageId": 4, "position": 1}));
    }

    #[test]
    fn test_user_plan_defaults_to_free() {
        let json = serde_json::json!({
            "id": 1,
            "email": "a@b.co",
            "name": null,
            "notionUserId": null,
            "notionWorkspaceId": null,
            "isActive": true,
            "createdAt": "2024-03-01T10:00:00Z",
            "updatedAt": "2024-03-01T10:00:00Z"
        });
        let user: User = serde_json::from_value(json).unwrap();
        assert_eq!(user.plan, Plan::Free);
        assert_eq!(Plan::from_str("pro").unwrap(), Plan::Pro);
    }
}
