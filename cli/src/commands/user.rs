use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use cookbook_core::db::Database;
use cookbook_core::models::NewUser;

use super::helpers::{resolve_user, truncate};

pub(crate) fn cmd_user_create(
    db: &Database,
    email: &str,
    password: &str,
    name: &str,
    superuser: bool,
    json: bool,
) -> Result<()> {
    let new_user = NewUser {
        email: email.to_string(),
        password: password.to_string(),
        name: name.to_string(),
    };
    let user = if superuser {
        db.create_superuser(&new_user)?
    } else {
        db.create_user(&new_user)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        let kind = if user.is_superuser { "superuser" } else { "user" };
        println!("Created {kind}: {} (id: {})", user.email, user.id);
        println!("Issue a token with: cookbook user token {}", user.email);
    }
    Ok(())
}

pub(crate) fn cmd_user_list(db: &Database, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct UserRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Active")]
        active: &'static str,
        #[tabled(rename = "Superuser")]
        superuser: &'static str,
    }

    let users = db.list_users()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }

    if users.is_empty() {
        eprintln!("No users yet. Create one with: cookbook user create <email> --password <pw>");
        return Ok(());
    }

    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let rows: Vec<UserRow> = users
        .iter()
        .map(|u| UserRow {
            id: u.id,
            email: truncate(&u.email, 40),
            name: truncate(&u.name, 30),
            active: yes_no(u.is_active),
            superuser: yes_no(u.is_superuser),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..)).with(Alignment::center()))
        .to_string();
    println!("{table}");

    Ok(())
}

/// Print the user's API token, creating it on first use.
pub(crate) fn cmd_user_token(db: &Database, email: &str, json: bool) -> Result<()> {
    let user = resolve_user(db, email, json)?;
    let token = db.get_or_create_token(user.id)?;

    if json {
        println!("{}", serde_json::json!({ "token": token }));
    } else {
        println!("{token}");
        eprintln!("Include in requests: Authorization: Token {token}");
    }
    Ok(())
}
