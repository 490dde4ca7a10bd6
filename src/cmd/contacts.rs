//! Contact and tag commands: `crm contacts`, `crm tags`.

use std::sync::Arc;

use anyhow::Result;
use crm::client::{ApiClient, ResourceApi};
use crm::forms::{ContactForm, TagForm, submit_create};
use crm::hooks::{Collection, ContactsHook};
use crm_common::{Contact, ContactFilter, ListQuery, Tag, TagFilter};
use serde_json::json;

use super::{CliEnv, page_skip};
use crate::{ContactCommands, TagCommands};

pub async fn cmd_contacts(env: &CliEnv, command: ContactCommands) -> Result<()> {
    let api: Arc<dyn ResourceApi<Contact>> = Arc::new(env.client()?);

    match command {
        ContactCommands::List { search, tag, page } => {
            let size = env.page_size();
            let hook = ContactsHook::new(
                api,
                ListQuery::new(ContactFilter {
                    search,
                    tag_id: tag,
                })
                .with_window(page_skip(page, size), size),
            );
            hook.fetch().await?;
            let state = hook.snapshot();
            env.emit(&json!({ "items": state.items, "total": state.total }), || {
                for contact in &state.items {
                    print_contact_line(contact);
                }
                println!(
                    "{}",
                    console::style(format!("{} of {} contacts", state.items.len(), state.total))
                        .dim()
                );
            })
        }
        ContactCommands::Create {
            name,
            email,
            phone,
            company,
            tags,
        } => {
            let form = ContactForm {
                name,
                email,
                phone,
                company,
                tag_ids: tags,
            };
            let contact = submit_create(&form, api.as_ref()).await?;
            env.emit(&contact, || {
                println!("{} Created contact", console::style("✓").green());
                print_contact_line(&contact);
            })
        }
        ContactCommands::Delete { id } => {
            let hook = ContactsHook::new(api, ListQuery::default());
            hook.delete(id).await?;
            println!("Deleted contact {}.", id);
            Ok(())
        }
    }
}

fn print_contact_line(contact: &Contact) {
    let tags: Vec<String> = contact
        .tags
        .iter()
        .map(|t| format!("#{}", t.name))
        .collect();
    println!(
        "{:>5}  {:<24} {:<28} {:<20} {}",
        contact.id,
        console::style(&contact.name).bold(),
        contact.email.as_deref().unwrap_or(""),
        contact.company.as_deref().unwrap_or(""),
        console::style(tags.join(" ")).cyan()
    );
}

pub async fn cmd_tags(env: &CliEnv, command: TagCommands) -> Result<()> {
    let client = env.client()?;

    match command {
        TagCommands::List { search } => {
            let tags = list_tags(&client, &TagFilter { search }).await?;
            env.emit(&tags, || {
                for tag in &tags {
                    println!(
                        "{:>5}  {:<24} {}",
                        tag.id,
                        console::style(&tag.name).bold(),
                        tag.color
                    );
                }
            })
        }
        TagCommands::Create { name, color } => {
            let api: Arc<dyn ResourceApi<Tag>> = Arc::new(client);
            let tag = submit_create(&TagForm { name, color }, api.as_ref()).await?;
            env.emit(&tag, || {
                println!("{} Created tag {} ({})", console::style("✓").green(), tag.name, tag.color);
            })
        }
        TagCommands::Delete { id } => {
            let hook = Collection::<Tag>::new(Arc::new(client), ListQuery::default());
            hook.delete(id).await?;
            println!("Deleted tag {}.", id);
            Ok(())
        }
    }
}

/// `GET /tags` answers with a bare array; [`crm_common::Page`] accepts both shapes.
async fn list_tags(client: &ApiClient, filter: &TagFilter) -> Result<Vec<Tag>> {
    let page = client.list::<Tag>(&ListQuery::new(filter.clone())).await?;
    Ok(page.items)
}
