use anyhow::Result;
use serde::Serialize;
use std::process;
use tabled::{
    Table, Tabled,
    settings::Style,
};

use cookbook_core::db::Database;
use cookbook_core::models::{Attribute, User};

/// Look up an account by email. An unknown email exits with code 2.
pub(crate) fn resolve_user(db: &Database, email: &str, json: bool) -> Result<User> {
    if let Some(user) = db.get_user_by_email(email)? {
        return Ok(user);
    }
    let message = format!("No user with email '{email}'");
    if json {
        println!("{}", json_error(&message));
    } else {
        eprintln!("{message}");
    }
    process::exit(2);
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

/// Join attribute names for a single table cell.
pub(crate) fn join_names(attributes: &[Attribute]) -> String {
    attributes
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn print_attribute_table(attributes: &[Attribute]) {
    #[derive(Tabled)]
    struct AttributeRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
    }

    let rows: Vec<AttributeRow> = attributes
        .iter()
        .map(|a| AttributeRow {
            id: a.id,
            name: truncate(&a.name, 40),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}
