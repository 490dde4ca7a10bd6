//! Pipeline and board commands: `crm pipelines`, `crm board`.

use std::sync::Arc;

use anyhow::Result;
use crm::board::Board;
use crm::client::ResourceApi;
use crm::forms::{PipelineForm, StageField, submit_create, submit_update};
use crm::hooks::PipelinesHook;
use crm_common::{Deal, ListQuery, Pipeline, PipelineFilter};
use serde_json::json;

use super::{CliEnv, format_money, page_skip};
use crate::PipelineCommands;

pub async fn cmd_pipelines(env: &CliEnv, command: PipelineCommands) -> Result<()> {
    let client = env.client()?;
    let api: Arc<dyn ResourceApi<Pipeline>> = Arc::new(client);

    match command {
        PipelineCommands::List { search, page } => {
            let size = env.page_size();
            let query = ListQuery::new(PipelineFilter { search }).with_window(page_skip(page, size), size);
            let hook = PipelinesHook::new(api, query);
            hook.fetch().await?;
            let state = hook.snapshot();
            env.emit(&json!({ "items": state.items, "total": state.total }), || {
                if state.items.is_empty() {
                    println!("No pipelines.");
                    return;
                }
                for pipeline in &state.items {
                    print_pipeline_line(pipeline);
                }
                println!(
                    "{}",
                    console::style(format!(
                        "page {} · {} of {} pipelines",
                        page.max(1),
                        state.items.len(),
                        state.total
                    ))
                    .dim()
                );
            })
        }
        PipelineCommands::Show { id } => {
            let pipeline = api.get(id).await?;
            env.emit(&pipeline, || {
                print_pipeline_line(&pipeline);
                for stage in pipeline.ordered_stages() {
                    println!(
                        "  [{}] {:<24} {:>4} deals  {:>12}",
                        stage.id,
                        stage.name,
                        stage.deal_count.unwrap_or(0),
                        format_money(stage.deal_value.unwrap_or(0.0))
                    );
                }
            })
        }
        PipelineCommands::Create { name, stages } => {
            let form = PipelineForm {
                name,
                stages: stages
                    .into_iter()
                    .map(|name| StageField { id: None, name })
                    .collect(),
            };
            let pipeline = submit_create(&form, api.as_ref()).await?;
            env.emit(&pipeline, || {
                println!("{} Created pipeline", console::style("✓").green());
                print_pipeline_line(&pipeline);
            })
        }
        PipelineCommands::Rename { id, name } => {
            let current = api.get(id).await?;
            let form = PipelineForm {
                name,
                ..PipelineForm::from_pipeline(&current)
            };
            let pipeline = submit_update(&form, id, api.as_ref()).await?;
            env.emit(&pipeline, || print_pipeline_line(&pipeline))
        }
        PipelineCommands::Delete { id } => {
            let hook = PipelinesHook::new(api, ListQuery::default());
            hook.delete(id).await?;
            println!("Deleted pipeline {} and its deals.", id);
            Ok(())
        }
    }
}

fn print_pipeline_line(pipeline: &Pipeline) {
    let stages: Vec<&str> = pipeline
        .ordered_stages()
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();
    println!(
        "{:>5}  {}  {}",
        pipeline.id,
        console::style(&pipeline.name).bold(),
        console::style(stages.join(" → ")).dim()
    );
}

pub async fn cmd_board(env: &CliEnv, pipeline_id: i64) -> Result<()> {
    let client = env.client()?;
    let deals: Arc<dyn ResourceApi<Deal>> = Arc::new(client.clone());
    let board = Board::load(&client, deals, pipeline_id).await?;
    let state = board.snapshot();
    let columns = state.columns();
    let totals = state.stage_totals();

    env.emit(&json!({ "pipeline": state.pipeline(), "columns": columns_json(&columns) }), || {
        println!(
            "{} ({} deals)",
            console::style(&state.pipeline().name).bold().cyan(),
            state.deal_count()
        );
        for (column, total) in columns.iter().zip(&totals) {
            println!();
            println!(
                "{}  {}",
                console::style(&column.stage.name).bold(),
                console::style(format!("{} · {}", total.count, format_money(total.value))).dim()
            );
            if column.deals.is_empty() {
                println!("  {}", console::style("(empty)").dim());
            }
            for deal in &column.deals {
                println!(
                    "  {:>3}. [{}] {:<28} {:>12}  {}",
                    deal.position,
                    deal.id,
                    deal.name,
                    format_money(deal.value),
                    deal.status.as_str()
                );
            }
        }
    })
}

fn columns_json(columns: &[crm::board::ColumnView]) -> serde_json::Value {
    columns
        .iter()
        .map(|c| json!({ "stage": c.stage, "deals": c.deals }))
        .collect()
}
