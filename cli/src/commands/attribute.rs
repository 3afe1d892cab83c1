use anyhow::Result;
use std::process;

use cookbook_core::db::Database;
use cookbook_core::models::AttributeKind;

use super::helpers::{print_attribute_table, resolve_user};

/// List a user's tags or ingredients, optionally only those used by a recipe.
pub(crate) fn cmd_attribute_list(
    db: &Database,
    kind: AttributeKind,
    email: &str,
    assigned_only: bool,
    json: bool,
) -> Result<()> {
    let user = resolve_user(db, email, json)?;
    let attributes = db.list_attributes(kind, user.id, assigned_only)?;

    if attributes.is_empty() {
        if json {
            println!("[]");
        } else {
            let what = match kind {
                AttributeKind::Tag => "tags",
                AttributeKind::Ingredient => "ingredients",
            };
            eprintln!("No {what} found");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&attributes)?);
    } else {
        print_attribute_table(&attributes);
    }
    Ok(())
}
