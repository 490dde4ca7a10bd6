//! In-memory `ResourceApi` used by hook and board tests.
//!
//! Supports failure injection and gates: a gated call parks until the test
//! releases it, which lets tests observe optimistic state while a request
//! is still outstanding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crm_common::{
    Contact, ContactUpdate, Deal, DealUpdate, ListQuery, NewContact, NewDeal, NewPipeline, Page,
    Pipeline, PipelineUpdate, Resource,
};
use tokio::sync::Notify;

use super::ResourceApi;
use crate::errors::ClientError;

type Build<R> = Box<dyn Fn(i64, &<R as Resource>::Create) -> R + Send + Sync>;
type Apply<R> = Box<dyn Fn(&mut R, &<R as Resource>::Update) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    List { skip: u32, take: u32 },
    Get(i64),
    Create,
    Update(i64),
    Delete(i64),
}

pub(crate) struct MemoryApi<R: Resource> {
    items: Mutex<Vec<R>>,
    next_id: AtomicI64,
    build: Build<R>,
    apply: Apply<R>,
    fail_writes: AtomicBool,
    fail_lists: AtomicBool,
    /// Largest page a list answers with; 0 for no limit.
    take_cap: AtomicU32,
    write_gate: Mutex<Option<Arc<Notify>>>,
    list_gates: Mutex<VecDeque<Arc<Notify>>>,
    calls: Mutex<Vec<Call>>,
}

impl<R: Resource> MemoryApi<R> {
    pub(crate) fn new(items: Vec<R>, build: Build<R>, apply: Apply<R>) -> Self {
        let next_id = items.iter().map(|i| i.id()).max().unwrap_or(0) + 1;
        Self {
            items: Mutex::new(items),
            next_id: AtomicI64::new(next_id),
            build,
            apply,
            fail_writes: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            take_cap: AtomicU32::new(0),
            write_gate: Mutex::new(None),
            list_gates: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Answer lists with at most `cap` rows whatever `take` asks for.
    pub(crate) fn cap_take(&self, cap: u32) {
        self.take_cap.store(cap, Ordering::SeqCst);
    }

    /// Park every subsequent write until the returned handle is notified.
    pub(crate) fn gate_writes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.write_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Park the next list call until the returned handle is notified.
    pub(crate) fn gate_next_list(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.list_gates.lock().unwrap().push_back(gate.clone());
        gate
    }

    pub(crate) fn replace_items(&self, items: Vec<R>) {
        *self.items.lock().unwrap() = items;
    }

    pub(crate) fn items(&self) -> Vec<R> {
        self.items.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn list_windows(&self) -> Vec<(u32, u32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::List { skip, take } => Some((skip, take)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pass_write_gate(&self) -> Result<(), ClientError> {
        let gate = self.write_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                status: 500,
                message: "write rejected".into(),
            });
        }
        Ok(())
    }

    fn not_found(id: i64) -> ClientError {
        ClientError::Status {
            status: 404,
            message: format!("{} {} not found", R::NAME, id),
        }
    }
}

#[async_trait]
impl<R: Resource> ResourceApi<R> for MemoryApi<R> {
    async fn list(&self, query: &ListQuery<R::Filter>) -> Result<Page<R>, ClientError> {
        self.record(Call::List {
            skip: query.skip,
            take: query.take,
        });
        // Snapshot at call time so a parked list answers with what the
        // backend held when the request was issued.
        let snapshot = self.items();
        let gate = self.list_gates.lock().unwrap().pop_front();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                status: 503,
                message: "backend unavailable".into(),
            });
        }
        let total = snapshot.len() as u64;
        let take = match self.take_cap.load(Ordering::SeqCst) {
            0 => query.take,
            cap => query.take.min(cap),
        };
        let items = snapshot
            .into_iter()
            .skip(query.skip as usize)
            .take(take as usize)
            .collect();
        Ok(Page::new(items, total))
    }

    async fn get(&self, id: i64) -> Result<R, ClientError> {
        self.record(Call::Get(id));
        self.items()
            .into_iter()
            .find(|i| i.id() == id)
            .ok_or_else(|| Self::not_found(id))
    }

    async fn create(&self, payload: &R::Create) -> Result<R, ClientError> {
        self.record(Call::Create);
        self.pass_write_gate().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let item = (self.build)(id, payload);
        self.items.lock().unwrap().push(item.clone());
        Ok(item)
    }

    async fn update(&self, id: i64, patch: &R::Update) -> Result<R, ClientError> {
        self.record(Call::Update(id));
        self.pass_write_gate().await?;
        let mut items = self.items.lock().unwrap();
        let item = items
            .iter_mut()
            .find(|i| i.id() == id)
            .ok_or_else(|| Self::not_found(id))?;
        (self.apply)(item, patch);
        Ok(item.clone())
    }

    async fn delete(&self, id: i64) -> Result<(), ClientError> {
        self.record(Call::Delete(id));
        self.pass_write_gate().await?;
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| i.id() != id);
        if items.len() == before {
            return Err(Self::not_found(id));
        }
        Ok(())
    }
}

impl MemoryApi<Deal> {
    pub(crate) fn deals(items: Vec<Deal>) -> Self {
        Self::new(
            items,
            Box::new(|id: i64, new: &NewDeal| {
                let mut deal = fixtures::deal(id, new.stage_id, 0);
                deal.name = new.name.clone();
                deal.value = new.value;
                deal.pipeline_id = new.pipeline_id;
                deal
            }),
            Box::new(|deal: &mut Deal, patch: &DealUpdate| {
                if let Some(stage_id) = patch.stage_id {
                    deal.stage_id = stage_id;
                }
                if let Some(position) = patch.position {
                    deal.position = position;
                }
                if let Some(name) = &patch.name {
                    deal.name = name.clone();
                }
                if let Some(value) = patch.value {
                    deal.value = value;
                }
                if let Some(status) = patch.status {
                    deal.status = status;
                }
                if let Some(date) = patch.expected_close_date {
                    deal.expected_close_date = date;
                }
                if let Some(fields) = &patch.custom_fields {
                    deal.custom_fields = fields.clone();
                }
            }),
        )
    }
}

impl MemoryApi<Pipeline> {
    pub(crate) fn pipelines(items: Vec<Pipeline>) -> Self {
        Self::new(
            items,
            Box::new(|id: i64, new: &NewPipeline| fixtures::pipeline(id, &new.name, &[])),
            Box::new(|pipeline: &mut Pipeline, patch: &PipelineUpdate| {
                if let Some(name) = &patch.name {
                    pipeline.name = name.clone();
                }
            }),
        )
    }
}

impl MemoryApi<Contact> {
    pub(crate) fn contacts(items: Vec<Contact>) -> Self {
        Self::new(
            items,
            Box::new(|id: i64, new: &NewContact| {
                let mut contact = fixtures::contact(id, &new.name);
                contact.email = new.email.clone();
                contact
            }),
            Box::new(|contact: &mut Contact, patch: &ContactUpdate| {
                if let Some(name) = &patch.name {
                    contact.name = name.clone();
                }
                if let Some(email) = &patch.email {
                    contact.email = Some(email.clone());
                }
            }),
        )
    }
}

pub(crate) mod fixtures {
    use chrono::{DateTime, Utc};
    use crm_common::{Contact, Deal, DealStatus, Pipeline, Stage};

    pub(crate) fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    pub(crate) fn deal(id: i64, stage_id: i64, position: i32) -> Deal {
        Deal {
            id,
            name: format!("Deal {}", id),
            value: 100.0 * id as f64,
            status: DealStatus::Active,
            stage_id,
            pipeline_id: 1,
            user_id: 1,
            position,
            expected_close_date: None,
            custom_fields: Default::default(),
            notion: None,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    /// Pipeline whose stages get ids `stage_ids` at positions 0..n.
    pub(crate) fn pipeline(id: i64, name: &str, stage_ids: &[i64]) -> Pipeline {
        Pipeline {
            id,
            name: name.to_string(),
            stages: stage_ids
                .iter()
                .enumerate()
                .map(|(pos, sid)| Stage {
                    id: *sid,
                    name: format!("S{}", sid),
                    pipeline_id: id,
                    position: pos as i32,
                    deal_count: None,
                    deal_value: None,
                })
                .collect(),
            created_at: ts(),
            updated_at: ts(),
        }
    }

    pub(crate) fn contact(id: i64, name: &str) -> Contact {
        Contact {
            id,
            name: name.to_string(),
            email: None,
            phone: None,
            company: None,
            tags: Vec::new(),
            created_at: ts(),
            updated_at: ts(),
        }
    }
}
