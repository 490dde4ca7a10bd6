use std::collections::HashMap;

use crm_common::{Deal, DealUpdate, Pipeline, Stage};
use serde::Serialize;

use crate::errors::BoardError;

/// Drag lifecycle of one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardState {
    #[default]
    Idle,
    Dragging,
    PendingCommit,
    Reverted,
}

impl CardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dragging => "dragging",
            Self::PendingCommit => "pending_commit",
            Self::Reverted => "reverted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub stage_id: i64,
    pub position: i32,
}

/// A local move waiting for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMove {
    pub deal_id: i64,
    pub from: Placement,
    pub to: Placement,
}

impl PendingMove {
    pub fn update(&self) -> DealUpdate {
        DealUpdate::move_to(self.to.stage_id, self.to.position)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnView {
    pub stage: Stage,
    pub deals: Vec<Deal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTotals {
    pub stage_id: i64,
    pub count: usize,
    pub value: f64,
}

/// Local copy of one pipeline board.
///
/// Pure state: no I/O. Positions inside every stage are kept at 0..n-1.
#[derive(Debug, Clone)]
pub struct BoardState {
    pipeline: Pipeline,
    deals: Vec<Deal>,
    cards: HashMap<i64, CardState>,
    origins: HashMap<i64, Placement>,
}

impl BoardState {
    pub fn new(pipeline: Pipeline, deals: Vec<Deal>) -> Self {
        let mut board = Self {
            pipeline,
            deals,
            cards: HashMap::new(),
            origins: HashMap::new(),
        };
        let stage_ids: Vec<i64> = board.pipeline.stages.iter().map(|s| s.id).collect();
        for stage_id in stage_ids {
            let order = board.stage_order(stage_id);
            board.renumber(&order);
        }
        board
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn deals(&self) -> &[Deal] {
        &self.deals
    }

    pub fn deal(&self, id: i64) -> Option<&Deal> {
        self.deals.iter().find(|d| d.id == id)
    }

    pub fn deal_count(&self) -> usize {
        self.deals.len()
    }

    pub fn card_state(&self, id: i64) -> Option<CardState> {
        self.deal(id)
            .map(|_| self.cards.get(&id).copied().unwrap_or_default())
    }

    pub fn placement(&self, id: i64) -> Option<Placement> {
        self.deal(id).map(|d| Placement {
            stage_id: d.stage_id,
            position: d.position,
        })
    }

    /// Stages in display order, each with its deals sorted by position.
    pub fn columns(&self) -> Vec<ColumnView> {
        self.pipeline
            .ordered_stages()
            .into_iter()
            .map(|stage| ColumnView {
                stage: stage.clone(),
                deals: self
                    .stage_order(stage.id)
                    .into_iter()
                    .filter_map(|id| self.deal(id).cloned())
                    .collect(),
            })
            .collect()
    }

    pub fn stage_totals(&self) -> Vec<StageTotals> {
        self.pipeline
            .ordered_stages()
            .into_iter()
            .map(|stage| {
                let in_stage = self.deals.iter().filter(|d| d.stage_id == stage.id);
                let (count, value) =
                    in_stage.fold((0, 0.0), |(n, sum), d| (n + 1, sum + d.value));
                StageTotals {
                    stage_id: stage.id,
                    count,
                    value,
                }
            })
            .collect()
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// idle | reverted → dragging.
    pub fn begin_drag(&mut self, id: i64) -> Result<(), BoardError> {
        match self.card_state(id) {
            None => Err(BoardError::UnknownDeal { id }),
            Some(CardState::PendingCommit) => Err(BoardError::MoveInFlight { id }),
            Some(_) => {
                self.cards.insert(id, CardState::Dragging);
                Ok(())
            }
        }
    }

    /// dragging → idle.
    pub fn cancel_drag(&mut self, id: i64) -> Result<(), BoardError> {
        self.expect_state(id, CardState::Dragging)?;
        self.cards.insert(id, CardState::Idle);
        Ok(())
    }

    /// Drop a dragged card on `stage_id` at `position`.
    ///
    /// Moves the card locally and returns the move to send to the server,
    /// or `None` when the drop lands on the card's current placement. A
    /// stage outside this pipeline cancels the drag.
    pub fn drop_at(
        &mut self,
        id: i64,
        stage_id: i64,
        position: i32,
    ) -> Result<Option<PendingMove>, BoardError> {
        self.expect_state(id, CardState::Dragging)?;
        if !self.pipeline.contains_stage(stage_id) {
            self.cards.insert(id, CardState::Idle);
            return Err(BoardError::ForeignStage {
                stage_id,
                pipeline_id: self.pipeline.id,
            });
        }
        let from = self
            .placement(id)
            .ok_or(BoardError::UnknownDeal { id })?;
        let slots = self
            .stage_order(stage_id)
            .into_iter()
            .filter(|other| *other != id)
            .count();
        let to = Placement {
            stage_id,
            position: position.clamp(0, slots as i32),
        };
        if to == from {
            self.cards.insert(id, CardState::Idle);
            return Ok(None);
        }

        self.place(id, to);
        self.origins.insert(id, from);
        self.cards.insert(id, CardState::PendingCommit);
        Ok(Some(PendingMove {
            deal_id: id,
            from,
            to,
        }))
    }

    /// pendingCommit → idle, adopting the server's copy of the deal.
    pub fn commit(&mut self, server: Deal) -> Result<(), BoardError> {
        let id = server.id;
        self.expect_state(id, CardState::PendingCommit)?;
        let to = Placement {
            stage_id: server.stage_id,
            position: server.position,
        };
        if let Some(deal) = self.deals.iter_mut().find(|d| d.id == id) {
            *deal = server;
        }
        self.place(id, to);
        self.origins.remove(&id);
        self.cards.insert(id, CardState::Idle);
        Ok(())
    }

    /// pendingCommit → reverted, putting the card back where it came from.
    pub fn revert(&mut self, id: i64) -> Result<(), BoardError> {
        self.expect_state(id, CardState::PendingCommit)?;
        if let Some(origin) = self.origins.remove(&id) {
            self.place(id, origin);
        }
        self.cards.insert(id, CardState::Reverted);
        Ok(())
    }

    fn expect_state(&self, id: i64, expected: CardState) -> Result<(), BoardError> {
        match self.card_state(id) {
            None => Err(BoardError::UnknownDeal { id }),
            Some(state) if state == expected => Ok(()),
            Some(CardState::PendingCommit) => Err(BoardError::MoveInFlight { id }),
            Some(_) => Err(BoardError::NotDragging { id }),
        }
    }

    // ── Positioning ───────────────────────────────────────────────────

    /// Deal ids of one stage by (position, id).
    fn stage_order(&self, stage_id: i64) -> Vec<i64> {
        let mut in_stage: Vec<&Deal> = self
            .deals
            .iter()
            .filter(|d| d.stage_id == stage_id)
            .collect();
        in_stage.sort_by_key(|d| (d.position, d.id));
        in_stage.into_iter().map(|d| d.id).collect()
    }

    fn renumber(&mut self, order: &[i64]) {
        for (position, id) in order.iter().enumerate() {
            if let Some(deal) = self.deals.iter_mut().find(|d| d.id == *id) {
                deal.position = position as i32;
            }
        }
    }

    fn place(&mut self, id: i64, to: Placement) {
        let Some(from_stage) = self.deal(id).map(|d| d.stage_id) else {
            return;
        };
        let mut target: Vec<i64> = self
            .stage_order(to.stage_id)
            .into_iter()
            .filter(|other| *other != id)
            .collect();
        let at = (to.position.max(0) as usize).min(target.len());
        target.insert(at, id);

        if let Some(deal) = self.deals.iter_mut().find(|d| d.id == id) {
            deal.stage_id = to.stage_id;
        }
        self.renumber(&target);
        if from_stage != to.stage_id {
            let origin = self.stage_order(from_stage);
            self.renumber(&origin);
        }
    }
}
