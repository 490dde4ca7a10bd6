//! Pipeline board: stages as columns, deals as cards.
//!
//! [`BoardState`] is the pure per-card state machine:
//!
//! ```text
//! idle → dragging → pendingCommit → idle       (server accepted)
//!                                 → reverted   (server rejected)
//! dragging → idle                              (drag cancelled)
//! reverted → dragging                          (retry)
//! ```
//!
//! [`Board`] wraps it with the network round trip. A drop is applied
//! locally first, then sent as `PATCH /deals/{id}` with the new stage and
//! position; the reply either commits the server's copy or reverts the card.

mod state;

pub use state::{BoardState, CardState, ColumnView, PendingMove, Placement, StageTotals};

use std::sync::{Arc, Mutex, MutexGuard};

use crm_common::{Deal, DealFilter, Pipeline};

use crate::client::{ResourceApi, fetch_all};
use crate::errors::{BoardError, ClientError};

const LOAD_PAGE_SIZE: u32 = 100;

struct Inner {
    api: Arc<dyn ResourceApi<Deal>>,
    state: Mutex<BoardState>,
}

/// Shared handle to one board. Clones see the same state.
#[derive(Clone)]
pub struct Board {
    inner: Arc<Inner>,
}

impl Board {
    pub fn new(api: Arc<dyn ResourceApi<Deal>>, pipeline: Pipeline, deals: Vec<Deal>) -> Self {
        let state = BoardState::new(pipeline, deals);
        Self {
            inner: Arc::new(Inner {
                api,
                state: Mutex::new(state),
            }),
        }
    }

    /// Fetch a pipeline and every deal in it.
    pub async fn load(
        pipelines: &dyn ResourceApi<Pipeline>,
        deals: Arc<dyn ResourceApi<Deal>>,
        pipeline_id: i64,
    ) -> Result<Self, ClientError> {
        let pipeline = pipelines.get(pipeline_id).await?;
        let filter = DealFilter {
            pipeline_id: Some(pipeline_id),
            ..DealFilter::default()
        };
        let items = fetch_all(deals.as_ref(), filter, LOAD_PAGE_SIZE).await?;
        tracing::debug!(pipeline_id, deals = items.len(), "board loaded");
        Ok(Self::new(deals, pipeline, items))
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> BoardState {
        self.lock().clone()
    }

    pub fn begin_drag(&self, id: i64) -> Result<(), BoardError> {
        self.lock().begin_drag(id)
    }

    pub fn cancel_drag(&self, id: i64) -> Result<(), BoardError> {
        self.lock().cancel_drag(id)
    }

    /// Drop the dragged card and sync the move with the backend.
    ///
    /// Returns the committed placement, or `None` for a no-op drop.
    pub async fn drop_on(
        &self,
        id: i64,
        stage_id: i64,
        position: i32,
    ) -> Result<Option<Placement>, BoardError> {
        let pending = {
            let mut state = self.lock();
            state.drop_at(id, stage_id, position)?
        };
        let Some(pending) = pending else {
            return Ok(None);
        };

        match self.inner.api.update(id, &pending.update()).await {
            Ok(server) => {
                let mut state = self.lock();
                state.commit(server)?;
                Ok(state.placement(id))
            }
            Err(source) => {
                tracing::warn!(
                    deal_id = id,
                    from_stage = pending.from.stage_id,
                    to_stage = pending.to.stage_id,
                    error = %source,
                    "move rejected, reverting card"
                );
                let mut state = self.lock();
                state.revert(id)?;
                Err(BoardError::Commit { id, source })
            }
        }
    }

    /// Drag and drop in one call.
    pub async fn move_deal(
        &self,
        id: i64,
        stage_id: i64,
        position: i32,
    ) -> Result<Option<Placement>, BoardError> {
        self.begin_drag(id)?;
        self.drop_on(id, stage_id, position).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::memory::{Call, MemoryApi, fixtures};

    const S1: i64 = 11;
    const S2: i64 = 12;

    fn setup() -> (Arc<MemoryApi<Deal>>, Board) {
        let deals = vec![fixtures::deal(1, S1, 0)];
        let api = Arc::new(MemoryApi::deals(deals.clone()));
        let dyn_api: Arc<dyn ResourceApi<Deal>> = api.clone();
        let board = Board::new(dyn_api, fixtures::pipeline(1, "P1", &[S1, S2]), deals);
        (api, board)
    }

    async fn wait_for_update(api: &MemoryApi<Deal>, id: i64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !api.calls().contains(&Call::Update(id)) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("update never issued");
    }

    #[tokio::test]
    async fn test_move_is_visible_before_server_replies_then_reverts() {
        let (api, board) = setup();
        let gate = api.gate_writes();

        let task = tokio::spawn({
            let board = board.clone();
            async move { board.move_deal(1, S2, 0).await }
        });
        wait_for_update(&api, 1).await;

        let seen = board.snapshot();
        assert_eq!(seen.deal(1).unwrap().stage_id, S2);
        assert_eq!(seen.card_state(1), Some(CardState::PendingCommit));

        api.fail_writes(true);
        gate.notify_one();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(BoardError::Commit { id: 1, .. })));
        let after = board.snapshot();
        assert_eq!(after.deal(1).unwrap().stage_id, S1);
        assert_eq!(after.card_state(1), Some(CardState::Reverted));
    }

    #[tokio::test]
    async fn test_accepted_move_commits() {
        let (api, board) = setup();

        let placed = board.move_deal(1, S2, 0).await.unwrap();

        assert_eq!(placed, Some(Placement { stage_id: S2, position: 0 }));
        assert_eq!(board.snapshot().card_state(1), Some(CardState::Idle));
        assert_eq!(api.items()[0].stage_id, S2);
    }

    #[tokio::test]
    async fn test_noop_drop_sends_nothing() {
        let (api, board) = setup();
        assert_eq!(board.move_deal(1, S1, 0).await.unwrap(), None);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_stage_sends_nothing() {
        let (api, board) = setup();
        let err = board.move_deal(1, 77, 0).await.unwrap_err();
        assert!(matches!(err, BoardError::ForeignStage { stage_id: 77, .. }));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_drag_while_pending_is_refused() {
        let (api, board) = setup();
        let gate = api.gate_writes();
        let task = tokio::spawn({
            let board = board.clone();
            async move { board.move_deal(1, S2, 0).await }
        });
        wait_for_update(&api, 1).await;

        assert!(matches!(
            board.begin_drag(1),
            Err(BoardError::MoveInFlight { id: 1 })
        ));

        gate.notify_one();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_restores_stage() {
        let (_api, board) = setup();
        board.move_deal(1, S2, 0).await.unwrap();
        board.move_deal(1, S1, 0).await.unwrap();
        assert_eq!(board.snapshot().deal(1).unwrap().stage_id, S1);
    }

    #[tokio::test]
    async fn test_load_reads_all_pages() {
        let deals: Vec<Deal> = (1..=130).map(|id| fixtures::deal(id, S1, id as i32)).collect();
        let deal_api: Arc<dyn ResourceApi<Deal>> = Arc::new(MemoryApi::deals(deals));
        let pipelines = MemoryApi::pipelines(vec![fixtures::pipeline(1, "P1", &[S1, S2])]);

        let board = Board::load(&pipelines, deal_api, 1).await.unwrap();

        let snapshot = board.snapshot();
        assert_eq!(snapshot.deal_count(), 130);
        let totals = snapshot.stage_totals();
        assert_eq!(totals[0].count, 130);
        assert_eq!(totals[1].count, 0);
    }
}
