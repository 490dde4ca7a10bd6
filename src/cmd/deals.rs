//! Deal commands: `crm deals`.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use crm::board::Board;
use crm::client::{ResourceApi, fetch_all};
use crm::forms::{DealForm, submit_create};
use crm::hooks::Collection;
use crm_common::{Deal, DealFilter, DealStatus, ListQuery, Pipeline};
use serde_json::json;

use super::{CliEnv, format_money};
use crate::DealCommands;

pub async fn cmd_deals(env: &CliEnv, command: DealCommands) -> Result<()> {
    let client = env.client()?;
    let deals: Arc<dyn ResourceApi<Deal>> = Arc::new(client.clone());

    match command {
        DealCommands::List {
            pipeline,
            stage,
            status,
            search,
            all,
        } => {
            let status = status
                .as_deref()
                .map(|s| DealStatus::from_str(&s.to_lowercase()))
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = DealFilter {
                pipeline_id: pipeline,
                stage_id: stage,
                status,
                search,
            };
            let (items, total) = if all {
                let items = fetch_all(deals.as_ref(), filter, env.page_size()).await?;
                let total = items.len() as u64;
                (items, total)
            } else {
                let hook = Collection::<Deal>::new(
                    deals,
                    ListQuery::new(filter).with_window(0, env.page_size()),
                );
                hook.fetch().await?;
                (hook.items(), hook.total())
            };
            env.emit(&json!({ "items": items, "total": total }), || {
                for deal in &items {
                    print_deal_line(deal);
                }
                println!(
                    "{}",
                    console::style(format!("{} of {} deals", items.len(), total)).dim()
                );
            })
        }
        DealCommands::Create {
            name,
            pipeline,
            stage,
            value,
            status,
            close_date,
            fields,
        } => {
            let pipeline = client.get::<Pipeline>(pipeline).await?;
            let mut form = DealForm::for_pipeline(&pipeline);
            form.name = name;
            form.value = value;
            form.status = status;
            form.expected_close_date = close_date;
            form.custom_fields = fields.join("\n");
            if stage.is_some() {
                form.stage_id = stage;
            }
            let deal = submit_create(&form, deals.as_ref()).await?;
            env.emit(&deal, || {
                println!("{} Created deal", console::style("✓").green());
                print_deal_line(&deal);
            })
        }
        DealCommands::Move {
            id,
            stage,
            position,
        } => {
            let deal = deals.get(id).await?;
            let board = Board::load(&client, deals, deal.pipeline_id).await?;
            let placement = board.move_deal(id, stage, position).await?;
            let moved = board
                .snapshot()
                .deal(id)
                .cloned()
                .context("Deal left the board")?;
            env.emit(&moved, || match placement {
                Some(p) => println!(
                    "{} Deal {} is now at position {} of stage {}",
                    console::style("✓").green(),
                    id,
                    p.position,
                    p.stage_id
                ),
                None => println!("Deal {} is already there.", id),
            })
        }
        DealCommands::Delete { id } => {
            let hook = Collection::<Deal>::new(deals, ListQuery::default());
            hook.delete(id).await?;
            println!("Deleted deal {}.", id);
            Ok(())
        }
    }
}

fn print_deal_line(deal: &Deal) {
    let close = deal
        .expected_close_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    println!(
        "{:>5}  {:<28} {:>12}  {:<5}  stage {:<4} {}",
        deal.id,
        deal.name,
        format_money(deal.value),
        deal.status.as_str(),
        deal.stage_id,
        console::style(close).dim()
    );
}
