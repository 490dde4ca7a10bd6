//! Create/edit forms for pipelines, deals, contacts and tags.
//!
//! A form holds raw user input as strings. `validate_create` and
//! `validate_update` turn it into the typed request payload or a
//! [`FormErrors`] keyed by the wire field name. Submitting validates first,
//! then calls the API; a rejected request becomes the top-level message.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDate;
use crm_common::{
    Contact, ContactUpdate, CustomFields, CustomValue, Deal, DealStatus, DealUpdate, NewContact,
    NewDeal, NewPipeline, NewTag, Pipeline, PipelineUpdate, Resource, StageInput, Tag, TagUpdate,
};
use regex::Regex;

use crate::client::ResourceApi;
use crate::errors::ClientError;

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

static COLOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").unwrap());

static PHONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ().\-]{3,}[0-9]$").unwrap());

/// Field-level messages plus an optional top-level one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormErrors {
    pub fields: BTreeMap<&'static str, String>,
    pub message: Option<String>,
}

impl FormErrors {
    pub fn field(&mut self, name: &'static str, message: impl Into<String>) {
        self.fields.entry(name).or_insert_with(|| message.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.message.is_none()
    }

    fn finish<T>(self, value: impl FnOnce() -> T) -> Result<T, FormErrors> {
        if self.is_empty() { Ok(value()) } else { Err(self) }
    }
}

impl From<ClientError> for FormErrors {
    fn from(err: ClientError) -> Self {
        Self {
            fields: BTreeMap::new(),
            message: Some(err.message()),
        }
    }
}

impl std::fmt::Display for FormErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        parts.extend(self.fields.iter().map(|(k, v)| format!("{}: {}", k, v)));
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for FormErrors {}

/// A form bound to the resource it creates and edits.
pub trait Form {
    type Resource: Resource;

    fn validate_create(&self) -> Result<<Self::Resource as Resource>::Create, FormErrors>;

    fn validate_update(&self) -> Result<<Self::Resource as Resource>::Update, FormErrors>;
}

pub async fn submit_create<F: Form>(
    form: &F,
    api: &dyn ResourceApi<F::Resource>,
) -> Result<F::Resource, FormErrors> {
    let payload = form.validate_create()?;
    api.create(&payload).await.map_err(|e| {
        tracing::debug!(resource = <F::Resource as Resource>::NAME, error = %e, "create rejected");
        FormErrors::from(e)
    })
}

pub async fn submit_update<F: Form>(
    form: &F,
    id: i64,
    api: &dyn ResourceApi<F::Resource>,
) -> Result<F::Resource, FormErrors> {
    let patch = form.validate_update()?;
    api.update(id, &patch).await.map_err(|e| {
        tracing::debug!(resource = <F::Resource as Resource>::NAME, id, error = %e, "update rejected");
        FormErrors::from(e)
    })
}

fn required(errors: &mut FormErrors, field: &'static str, raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        errors.field(field, "Required");
    }
    value.to_string()
}

fn optional(raw: &str) -> Option<String> {
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_string())
}

// ── Pipeline ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageField {
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineForm {
    pub name: String,
    pub stages: Vec<StageField>,
}

impl PipelineForm {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            name: pipeline.name.clone(),
            stages: pipeline
                .ordered_stages()
                .into_iter()
                .map(|s| StageField {
                    id: Some(s.id),
                    name: s.name.clone(),
                })
                .collect(),
        }
    }

    fn check_stages(&self, errors: &mut FormErrors) -> Vec<StageField> {
        let stages: Vec<StageField> = self
            .stages
            .iter()
            .filter(|s| s.id.is_some() || !s.name.trim().is_empty())
            .map(|s| StageField {
                id: s.id,
                name: s.name.trim().to_string(),
            })
            .collect();
        if stages.is_empty() {
            errors.field("stages", "At least one stage is required");
        }
        if stages.iter().any(|s| s.name.is_empty()) {
            errors.field("stages", "Stage names cannot be blank");
        }
        let mut seen: Vec<String> = Vec::new();
        for stage in &stages {
            let key = stage.name.to_lowercase();
            if seen.contains(&key) {
                errors.field("stages", format!("Duplicate stage '{}'", stage.name));
            }
            seen.push(key);
        }
        stages
    }
}

impl Form for PipelineForm {
    type Resource = Pipeline;

    fn validate_create(&self) -> Result<NewPipeline, FormErrors> {
        let mut errors = FormErrors::default();
        let name = required(&mut errors, "name", &self.name);
        let stages = self.check_stages(&mut errors);
        errors.finish(|| NewPipeline {
            name,
            stages: stages.into_iter().map(|s| s.name).collect(),
        })
    }

    fn validate_update(&self) -> Result<PipelineUpdate, FormErrors> {
        let mut errors = FormErrors::default();
        let name = required(&mut errors, "name", &self.name);
        let stages = self.check_stages(&mut errors);
        errors.finish(|| PipelineUpdate {
            name: Some(name),
            stages: Some(
                stages
                    .into_iter()
                    .map(|s| StageInput {
                        id: s.id,
                        name: s.name,
                    })
                    .collect(),
            ),
        })
    }
}

// ── Deal ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DealForm {
    pub name: String,
    pub value: String,
    pub status: String,
    pub pipeline_id: Option<i64>,
    pub stage_id: Option<i64>,
    /// `YYYY-MM-DD`. Blank means none, and clears the date on update.
    pub expected_close_date: String,
    /// One `key=value` per line. Backslash, CR and LF inside a value are
    /// written `\\`, `\r` and `\n`.
    pub custom_fields: String,
    /// Typed values the form was loaded with. A line left as rendered keeps
    /// its stored type rather than being inferred again.
    pub loaded_fields: CustomFields,
    /// Stages of the selected pipeline; when set, `stage_id` must be one.
    pub allowed_stages: Vec<i64>,
}

impl DealForm {
    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            pipeline_id: Some(pipeline.id),
            stage_id: pipeline.ordered_stages().first().map(|s| s.id),
            allowed_stages: pipeline.stages.iter().map(|s| s.id).collect(),
            ..Self::default()
        }
    }

    pub fn from_deal(deal: &Deal) -> Self {
        Self {
            name: deal.name.clone(),
            value: deal.value.to_string(),
            status: deal.status.as_str().to_string(),
            pipeline_id: Some(deal.pipeline_id),
            stage_id: Some(deal.stage_id),
            expected_close_date: deal
                .expected_close_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            custom_fields: render_custom_fields(&deal.custom_fields),
            loaded_fields: deal.custom_fields.clone(),
            allowed_stages: Vec::new(),
        }
    }

    fn check(
        &self,
        errors: &mut FormErrors,
    ) -> (String, f64, DealStatus, Option<NaiveDate>, CustomFields) {
        let name = required(errors, "name", &self.name);
        let value = match self.value.trim() {
            "" => 0.0,
            raw => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 => v,
                Ok(_) => {
                    errors.field("value", "Must be zero or more");
                    0.0
                }
                Err(_) => {
                    errors.field("value", "Must be a number");
                    0.0
                }
            },
        };
        let status = match self.status.trim() {
            "" => DealStatus::default(),
            raw => DealStatus::from_str(&raw.to_lowercase()).unwrap_or_else(|e| {
                errors.field("status", e);
                DealStatus::default()
            }),
        };
        let expected_close_date = optional(&self.expected_close_date).and_then(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|_| errors.field("expectedCloseDate", "Use YYYY-MM-DD"))
                .ok()
        });
        if let Some(stage_id) = self.stage_id
            && !self.allowed_stages.is_empty()
            && !self.allowed_stages.contains(&stage_id)
        {
            errors.field("stageId", "Stage is not part of this pipeline");
        }
        let custom_fields = parse_custom_fields(errors, &self.custom_fields, &self.loaded_fields);
        (name, value, status, expected_close_date, custom_fields)
    }
}

fn render_custom_fields(fields: &CustomFields) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, escape_field(&v.to_string())))
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_field(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

fn unescape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_custom_fields(errors: &mut FormErrors, raw: &str, loaded: &CustomFields) -> CustomFields {
    let mut fields = CustomFields::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        match line.split_once('=') {
            Some((key, text)) if !key.trim().is_empty() => {
                let key = key.trim();
                let value = match loaded.get(key) {
                    Some(stored) if escape_field(&stored.to_string()) == text => stored.clone(),
                    _ => CustomValue::infer(&unescape_field(text.trim())),
                };
                fields.insert(key.to_string(), value);
            }
            _ => errors.field(
                "customFields",
                format!("Expected key=value, got '{}'", line.trim()),
            ),
        }
    }
    fields
}

impl Form for DealForm {
    type Resource = Deal;

    fn validate_create(&self) -> Result<NewDeal, FormErrors> {
        let mut errors = FormErrors::default();
        let (name, value, status, expected_close_date, custom_fields) = self.check(&mut errors);
        if self.pipeline_id.is_none() {
            errors.field("pipelineId", "Required");
        }
        if self.stage_id.is_none() {
            errors.field("stageId", "Required");
        }
        let pipeline_id = self.pipeline_id.unwrap_or_default();
        let stage_id = self.stage_id.unwrap_or_default();
        errors.finish(|| NewDeal {
            name,
            value,
            status,
            stage_id,
            pipeline_id,
            expected_close_date,
            custom_fields,
        })
    }

    fn validate_update(&self) -> Result<DealUpdate, FormErrors> {
        let mut errors = FormErrors::default();
        let (name, value, status, expected_close_date, custom_fields) = self.check(&mut errors);
        errors.finish(|| DealUpdate {
            name: Some(name),
            value: Some(value),
            status: Some(status),
            stage_id: self.stage_id,
            position: None,
            expected_close_date: Some(expected_close_date),
            custom_fields: Some(custom_fields),
        })
    }
}

// ── Contact ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub tag_ids: Vec<i64>,
}

impl ContactForm {
    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            name: contact.name.clone(),
            email: contact.email.clone().unwrap_or_default(),
            phone: contact.phone.clone().unwrap_or_default(),
            company: contact.company.clone().unwrap_or_default(),
            tag_ids: contact.tags.iter().map(|t| t.id).collect(),
        }
    }

    fn check(
        &self,
        errors: &mut FormErrors,
    ) -> (String, Option<String>, Option<String>, Vec<i64>) {
        let name = required(errors, "name", &self.name);
        let email = optional(&self.email);
        if let Some(email) = &email
            && !EMAIL_REGEX.is_match(email)
        {
            errors.field("email", "Invalid email address");
        }
        let phone = optional(&self.phone);
        if let Some(phone) = &phone
            && !PHONE_REGEX.is_match(phone)
        {
            errors.field("phone", "Invalid phone number");
        }
        let mut tag_ids = self.tag_ids.clone();
        tag_ids.sort_unstable();
        tag_ids.dedup();
        (name, email, phone, tag_ids)
    }
}

impl Form for ContactForm {
    type Resource = Contact;

    fn validate_create(&self) -> Result<NewContact, FormErrors> {
        let mut errors = FormErrors::default();
        let (name, email, phone, tag_ids) = self.check(&mut errors);
        errors.finish(|| NewContact {
            name,
            email,
            phone,
            company: optional(&self.company),
            tag_ids,
        })
    }

    /// Blank optional fields are sent as empty strings, which clears them.
    fn validate_update(&self) -> Result<ContactUpdate, FormErrors> {
        let mut errors = FormErrors::default();
        let (name, email, phone, tag_ids) = self.check(&mut errors);
        errors.finish(|| ContactUpdate {
            name: Some(name),
            email: Some(email.unwrap_or_default()),
            phone: Some(phone.unwrap_or_default()),
            company: Some(self.company.trim().to_string()),
            tag_ids: Some(tag_ids),
        })
    }
}

// ── Tag ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagForm {
    pub name: String,
    pub color: String,
}

impl TagForm {
    pub fn from_tag(tag: &Tag) -> Self {
        Self {
            name: tag.name.clone(),
            color: tag.color.clone(),
        }
    }

    fn check(&self, errors: &mut FormErrors) -> (String, String) {
        let name = required(errors, "name", &self.name);
        let color = self.color.trim().to_uppercase();
        if color.is_empty() {
            errors.field("color", "Required");
        } else if !COLOR_REGEX.is_match(&color) {
            errors.field("color", "Use #RRGGBB");
        }
        (name, color)
    }
}

impl Form for TagForm {
    type Resource = Tag;

    fn validate_create(&self) -> Result<NewTag, FormErrors> {
        let mut errors = FormErrors::default();
        let (name, color) = self.check(&mut errors);
        errors.finish(|| NewTag { name, color })
    }

    fn validate_update(&self) -> Result<TagUpdate, FormErrors> {
        let mut errors = FormErrors::default();
        let (name, color) = self.check(&mut errors);
        errors.finish(|| TagUpdate {
            name: Some(name),
            color: Some(color),
        })
    }
}
