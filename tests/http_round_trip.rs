//! End-to-end tests: the typed client, hooks and board against a real
//! backend bound to 127.0.0.1:0.

use std::collections::HashSet;
use std::sync::Arc;

use axum::Json;
use axum::routing::post;
use chrono::{Duration, Utc};
use crm::board::Board;
use crm::client::{ApiClient, ResourceApi, fetch_all};
use crm::config::NotionSection;
use crm::context::{AppContext, Credential};
use crm::errors::BoardError;
use crm::hooks::{ContactsHook, PipelinesHook};
use crm::server::db::CrmDb;
use crm::server::{RunningServer, ServerConfig, spawn};
use crm::session::token::{self, Claims};
use crm_common::{
    ContactFilter, Deal, DealFilter, DealUpdate, FilterPatch, ListQuery, NewContact, NewDeal,
    NewPipeline, NewTag, Pipeline, PipelineUpdate, StageInput, Tag, User,
};
use tempfile::TempDir;

const SECRET: &str = "round-trip-secret";

struct Harness {
    server: RunningServer,
    client: ApiClient,
    _dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(NotionSection::default(), "http://localhost:3000").await
    }

    async fn start_with(notion: NotionSection, dashboard_url: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("crm.db");
        let user = CrmDb::new(&db_path)
            .unwrap()
            .ensure_user("ada@example.com", Some("Ada"))
            .unwrap();

        let server = spawn(ServerConfig {
            port: 0,
            dashboard_port: 0,
            db_path,
            token_secret: SECRET.into(),
            notion,
            dashboard_url: dashboard_url.into(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();

        let client = client_for(&server, Some(&token_for(&user, SECRET)));
        Self {
            server,
            client,
            _dir: dir,
        }
    }

    async fn pipeline(&self, name: &str, stages: &[&str]) -> Pipeline {
        self.client
            .create::<Pipeline>(&NewPipeline {
                name: name.into(),
                stages: stages.iter().map(|s| s.to_string()).collect(),
            })
            .await
            .unwrap()
    }

    async fn deal(&self, pipeline: &Pipeline, stage_index: usize, name: &str, value: f64) -> Deal {
        let stage = pipeline.ordered_stages()[stage_index].id;
        self.client
            .create::<Deal>(&NewDeal {
                name: name.into(),
                value,
                status: Default::default(),
                stage_id: stage,
                pipeline_id: pipeline.id,
                expected_close_date: None,
                custom_fields: Default::default(),
            })
            .await
            .unwrap()
    }
}

fn token_for(user: &User, secret: &str) -> String {
    let claims = Claims::new(user.id, &user.email, Utc::now(), Duration::hours(1));
    token::issue(&claims, secret.as_bytes()).unwrap()
}

fn client_for(server: &RunningServer, token: Option<&str>) -> ApiClient {
    let ctx = AppContext::new(server.api_url()).with_credential(token.and_then(Credential::new));
    ApiClient::new(&ctx).unwrap()
}

fn no_redirects() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn location(resp: &reqwest::Response) -> String {
    resp.headers()[reqwest::header::LOCATION]
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_pipeline_crud_round_trip() {
    let h = Harness::start().await;
    let created = h.pipeline("Sales", &["Lead", "Won"]).await;
    let stages: Vec<i64> = created.ordered_stages().iter().map(|s| s.id).collect();
    assert_eq!(stages.len(), 2);
    assert!(created.has_strict_stage_order());

    let page = h.client.list::<Pipeline>(&ListQuery::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].name, "Sales");

    let updated = h
        .client
        .update::<Pipeline>(
            created.id,
            &PipelineUpdate {
                name: Some("Sales EU".into()),
                stages: Some(vec![
                    StageInput {
                        id: Some(stages[0]),
                        name: "Lead".into(),
                    },
                    StageInput {
                        id: None,
                        name: "Proposal".into(),
                    },
                    StageInput {
                        id: Some(stages[1]),
                        name: "Won".into(),
                    },
                ]),
            },
        )
        .await
        .unwrap();
    let names: Vec<&str> = updated
        .ordered_stages()
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(updated.name, "Sales EU");
    assert_eq!(names, ["Lead", "Proposal", "Won"]);
    assert_eq!(updated.ordered_stages()[2].id, stages[1]);

    h.client.delete::<Pipeline>(created.id).await.unwrap();
    let err = h.client.get::<Pipeline>(created.id).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(err.message().contains("not found"));

    h.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forty_five_deals_partition_into_three_pages() {
    let h = Harness::start().await;
    let pipeline = h.pipeline("Volume", &["Only"]).await;
    let mut created = HashSet::new();
    for i in 0..45 {
        created.insert(h.deal(&pipeline, 0, &format!("Deal {}", i), i as f64).await.id);
    }

    let filter = DealFilter {
        pipeline_id: Some(pipeline.id),
        ..DealFilter::default()
    };
    let mut query = ListQuery::new(filter.clone()).with_window(0, 20);
    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    for _ in 0..3 {
        let page = h.client.list::<Deal>(&query).await.unwrap();
        assert_eq!(page.total, 45);
        sizes.push(page.items.len());
        seen.extend(page.items.iter().map(|d| d.id));
        query.next_page();
    }
    assert_eq!(sizes, [20, 20, 5]);
    let unique: HashSet<i64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 45, "pages overlapped");
    assert_eq!(unique, created, "pages left a gap");

    let all = fetch_all(&h.client as &dyn ResourceApi<Deal>, filter, 20)
        .await
        .unwrap();
    assert_eq!(all.len(), 45);

    let refreshed = h.client.get::<Pipeline>(pipeline.id).await.unwrap();
    let counted: i64 = refreshed
        .stages
        .iter()
        .map(|s| s.deal_count.unwrap_or(0))
        .sum();
    assert_eq!(counted, 45);
}

#[tokio::test]
async fn test_page_size_above_backend_cap_still_reads_every_deal() {
    let h = Harness::start().await;
    let pipeline = h.pipeline("Bulk", &["Only"]).await;
    let mut created = HashSet::new();
    for i in 0..130 {
        created.insert(h.deal(&pipeline, 0, &format!("Deal {}", i), 1.0).await.id);
    }
    let filter = DealFilter {
        pipeline_id: Some(pipeline.id),
        ..DealFilter::default()
    };

    let all = fetch_all(&h.client as &dyn ResourceApi<Deal>, filter.clone(), 150)
        .await
        .unwrap();
    let ids: HashSet<i64> = all.iter().map(|d| d.id).collect();
    assert_eq!(all.len(), 130);
    assert_eq!(ids, created);

    let mut query = ListQuery::new(filter).with_window(0, 150);
    let mut seen = HashSet::new();
    let mut sizes = Vec::new();
    for _ in 0..2 {
        let page = h.client.list::<Deal>(&query).await.unwrap();
        sizes.push(page.items.len());
        seen.extend(page.items.iter().map(|d| d.id));
        query.next_page();
    }
    assert_eq!(sizes, [100, 30]);
    assert_eq!(seen, created, "pages left a gap");

    h.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deal_close_date_can_be_cleared() {
    let h = Harness::start().await;
    let pipeline = h.pipeline("Dates", &["Only"]).await;
    let deal = h.deal(&pipeline, 0, "Renewal", 10.0).await;
    let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 30);

    let dated = h
        .client
        .update::<Deal>(
            deal.id,
            &DealUpdate {
                expected_close_date: Some(date),
                ..DealUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(dated.expected_close_date, date);

    let cleared = h
        .client
        .update::<Deal>(
            deal.id,
            &DealUpdate {
                expected_close_date: Some(None),
                ..DealUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.expected_close_date, None);

    h.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_board_move_round_trip_and_foreign_stage() {
    let h = Harness::start().await;
    let p1 = h.pipeline("P1", &["S1", "S2"]).await;
    let p2 = h.pipeline("P2", &["Other"]).await;
    let d1 = h.deal(&p1, 0, "D1", 100.0).await;
    let s1 = p1.ordered_stages()[0].id;
    let s2 = p1.ordered_stages()[1].id;

    let deals: Arc<dyn ResourceApi<Deal>> = Arc::new(h.client.clone());
    let board = Board::load(&h.client, deals, p1.id).await.unwrap();
    assert_eq!(board.snapshot().deal_count(), 1);

    let placed = board.move_deal(d1.id, s2, 0).await.unwrap().unwrap();
    assert_eq!(placed.stage_id, s2);
    assert_eq!(h.client.get::<Deal>(d1.id).await.unwrap().stage_id, s2);

    board.move_deal(d1.id, s1, 0).await.unwrap();
    assert_eq!(h.client.get::<Deal>(d1.id).await.unwrap().stage_id, s1);

    let foreign = p2.ordered_stages()[0].id;
    let err = board.move_deal(d1.id, foreign, 0).await.unwrap_err();
    assert!(matches!(err, BoardError::ForeignStage { .. }));

    // The backend refuses the same move when the board is bypassed.
    let err = h
        .client
        .update::<Deal>(d1.id, &DealUpdate::move_to(foreign, 0))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(h.client.get::<Deal>(d1.id).await.unwrap().stage_id, s1);
}

#[tokio::test]
async fn test_hooks_against_backend() {
    let h = Harness::start().await;
    let tag = h
        .client
        .create::<Tag>(&NewTag {
            name: "vip".into(),
            color: "#ff0000".into(),
        })
        .await
        .unwrap();
    assert_eq!(tag.color, "#FF0000");
    for (name, tagged) in [("Ada", true), ("Grace", false), ("Alan", true)] {
        h.client
            .create::<crm_common::Contact>(&NewContact {
                name: name.into(),
                tag_ids: if tagged { vec![tag.id] } else { vec![] },
                ..NewContact::default()
            })
            .await
            .unwrap();
    }

    let hook = ContactsHook::new(Arc::new(h.client.clone()), ListQuery::default());
    hook.fetch().await.unwrap();
    assert_eq!(hook.total(), 3);

    hook.apply_filters(FilterPatch::filter(ContactFilter {
        tag_id: Some(tag.id),
        ..ContactFilter::default()
    }))
    .await
    .unwrap();
    let names: HashSet<String> = hook.items().into_iter().map(|c| c.name).collect();
    assert_eq!(names, HashSet::from(["Ada".to_string(), "Alan".to_string()]));

    let pipelines = PipelinesHook::new(Arc::new(h.client.clone()), ListQuery::default());
    pipelines.fetch().await.unwrap();
    let err = pipelines.delete(999).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(pipelines.error().is_some());

    let tags = h
        .client
        .list::<Tag>(&ListQuery::default())
        .await
        .unwrap();
    assert_eq!(tags.total, 1);
}

#[tokio::test]
async fn test_bad_credentials_are_unauthorized() {
    let h = Harness::start().await;
    let me = h.client.current_user().await.unwrap();
    assert_eq!(me.email, "ada@example.com");

    let forged = token_for(&me, "some-other-secret");
    let err = client_for(&h.server, Some(&forged))
        .current_user()
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let err = client_for(&h.server, None)
        .list::<Pipeline>(&ListQuery::default())
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

/// Stand-in for Notion's token endpoint.
async fn fake_notion() -> String {
    let app = axum::Router::new().route(
        "/v1/oauth/token",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["grant_type"], "authorization_code");
            assert_eq!(body["code"], "good-code");
            Json(serde_json::json!({
                "access_token": "secret_notion_token",
                "bot_id": "bot-1",
                "workspace_id": "ws-1",
                "workspace_name": "Acme",
                "owner": {
                    "type": "user",
                    "user": {
                        "id": "notion-user-1",
                        "name": "Grace Hopper",
                        "person": { "email": "grace@example.com" }
                    }
                }
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_notion_login_flow() {
    let notion_base = fake_notion().await;
    let h = Harness::start_with(
        NotionSection {
            client_id: Some("cid".into()),
            client_secret: Some("csecret".into()),
            redirect_uri: Some("http://localhost:3000/auth/callback/notion".into()),
            api_base: notion_base,
        },
        "http://dash.test",
    )
    .await;
    let http = no_redirects();

    let resp = http
        .get(format!("{}/auth/notion/authorize", h.server.api_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 307);
    let consent = url::Url::parse(&location(&resp)).unwrap();
    let state = consent
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    // The browser comes back through the dashboard, which forwards to the API.
    let resp = http
        .get(format!(
            "{}/auth/callback/notion?code=good-code&state={}",
            h.server.dashboard_url(),
            state
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 307);
    let forwarded = location(&resp);
    assert!(forwarded.starts_with(&format!("{}/auth/notion/callback?", h.server.api_url())));

    let resp = http.get(&forwarded).send().await.unwrap();
    assert_eq!(resp.status(), 307);
    let landing = url::Url::parse(&location(&resp)).unwrap();
    assert_eq!(landing.host_str(), Some("dash.test"));
    assert_eq!(landing.path(), "/dashboard");
    let jwt = landing
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let me = client_for(&h.server, Some(&jwt)).current_user().await.unwrap();
    assert_eq!(me.email, "grace@example.com");
    assert_eq!(me.notion_workspace_id.as_deref(), Some("ws-1"));

    // Nonces are single use.
    let resp = http.get(&forwarded).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}
