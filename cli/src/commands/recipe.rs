use anyhow::Result;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use cookbook_core::db::Database;
use cookbook_core::models::{RecipeFilter, RecipeSummary, parse_id_list};

use super::helpers::{join_names, resolve_user, truncate};

pub(crate) fn cmd_recipe_list(
    db: &Database,
    email: &str,
    tags: Option<&str>,
    ingredients: Option<&str>,
    json: bool,
) -> Result<()> {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Title")]
        title: String,
        #[tabled(rename = "Minutes")]
        minutes: i64,
        #[tabled(rename = "Price")]
        price: String,
        #[tabled(rename = "Tags")]
        tags: String,
        #[tabled(rename = "Ingredients")]
        ingredients: String,
    }

    let user = resolve_user(db, email, json)?;
    let filter = RecipeFilter {
        tags: tags.map(|raw| parse_id_list("tags", raw)).transpose()?.flatten(),
        ingredients: ingredients
            .map(|raw| parse_id_list("ingredients", raw))
            .transpose()?
            .flatten(),
    };

    let recipes: Vec<RecipeSummary> = db
        .list_recipes(user.id, &filter)?
        .into_iter()
        .map(RecipeSummary::from)
        .collect();

    if recipes.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No recipes found");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&recipes)?);
        return Ok(());
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: r.id,
            title: truncate(&r.title, 30),
            minutes: r.time_minutes,
            price: r.price.to_string(),
            tags: truncate(&join_names(&r.tags), 30),
            ingredients: truncate(&join_names(&r.ingredients), 40),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}
