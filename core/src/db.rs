use std::fmt::Write;
use std::path::Path;

use chrono::Local;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::auth::{
    BAD_CREDENTIALS, HashedUser, LoginCredentials, ProfileChanges, generate_token, normalize_email,
};
use crate::error::{Error, Result};
use crate::models::{
    Attribute, AttributeKind, Descriptor, Ingredient, NewRecipe, NewUser, Price, Recipe,
    RecipeDetail, RecipeFilter, Tag, UpdateRecipe, UpdateUser, User, validate_name,
    validate_new_recipe, validate_recipe_update,
};

const USER_COLUMNS: &str = "id, email, name, is_active, is_staff, is_superuser, created_at";

const RECIPE_COLUMNS: &str = "id, user_id, title, time_minutes, price_cents, description, link, image, created_at, updated_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL DEFAULT '',
                    password_hash TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    is_staff INTEGER NOT NULL DEFAULT 0,
                    is_superuser INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS auth_tokens (
                    key TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    UNIQUE (user_id, name)
                );

                CREATE TABLE IF NOT EXISTS ingredients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    UNIQUE (user_id, name)
                );

                CREATE TABLE IF NOT EXISTS recipes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    time_minutes INTEGER NOT NULL,
                    price_cents INTEGER NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    link TEXT NOT NULL DEFAULT '',
                    image TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_tags (
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                    PRIMARY KEY (recipe_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    ingredient_id INTEGER NOT NULL REFERENCES ingredients(id) ON DELETE CASCADE,
                    PRIMARY KEY (recipe_id, ingredient_id)
                );

                CREATE INDEX IF NOT EXISTS idx_recipes_user ON recipes(user_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_tags_tag ON recipe_tags(tag_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_ingredient ON recipe_ingredients(ingredient_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            is_active: row.get(3)?,
            is_staff: row.get(4)?,
            is_superuser: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn recipe_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recipe> {
        Ok(Recipe {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            time_minutes: row.get(3)?,
            price: Price::from_cents(row.get(4)?),
            description: row.get(5)?,
            link: row.get(6)?,
            image: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn attribute_from_row(row: &rusqlite::Row) -> rusqlite::Result<Attribute> {
        Ok(Attribute {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }

    // --- Users ---

    pub fn create_user(&self, new_user: &NewUser) -> Result<User> {
        self.insert_user(&HashedUser::prepare(new_user)?, false)
    }

    /// Create an account with both the staff and superuser flags set.
    pub fn create_superuser(&self, new_user: &NewUser) -> Result<User> {
        self.insert_user(&HashedUser::prepare(new_user)?, true)
    }

    /// Insert an account whose password was hashed beforehand.
    pub fn register(&self, user: &HashedUser) -> Result<User> {
        self.insert_user(user, false)
    }

    fn insert_user(&self, user: &HashedUser, superuser: bool) -> Result<User> {
        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO users (email, name, password_hash, is_staff, is_superuser, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user.email, user.name, user.password_hash, superuser, superuser, now],
            )
            .map_err(Error::from)
            .map_err(duplicate_email)?;
        let id = self.conn.last_insert_rowid();
        self.get_user_by_id(id)
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<User> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                Self::user_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("User {id}")))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email)?;
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Apply a profile update. Every field is validated before anything is written.
    pub fn update_user(&self, id: i64, update: &UpdateUser) -> Result<User> {
        self.apply_profile_changes(id, &ProfileChanges::prepare(update)?)
    }

    pub fn apply_profile_changes(&self, id: i64, changes: &ProfileChanges) -> Result<User> {
        let mut user = self.get_user_by_id(id)?;
        if let Some(email) = &changes.email {
            user.email.clone_from(email);
        }
        if let Some(name) = &changes.name {
            user.name.clone_from(name);
        }

        let tx = self.conn.unchecked_transaction()?;
        self.conn
            .execute(
                "UPDATE users SET email = ?1, name = ?2 WHERE id = ?3",
                params![user.email, user.name, id],
            )
            .map_err(Error::from)
            .map_err(duplicate_email)?;
        if let Some(hash) = &changes.password_hash {
            self.conn.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![hash, id],
            )?;
        }
        tx.commit()?;

        self.get_user_by_id(id)
    }

    /// Look up what a login needs. Unknown, malformed and inactive emails all
    /// come back as `None`.
    pub fn login_credentials(&self, email: &str) -> Result<Option<LoginCredentials>> {
        let Ok(email) = normalize_email(email) else {
            return Ok(None);
        };
        let credentials = self
            .conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE email = ?1 AND is_active = 1",
                params![email],
                |row| {
                    Ok(LoginCredentials {
                        user_id: row.get(0)?,
                        password_hash: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(credentials)
    }

    /// Verify an email/password pair. Any mismatch, including an inactive
    /// account, reports the same generic error.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        match self
            .login_credentials(email)?
            .and_then(|credentials| credentials.verify(password))
        {
            Some(id) => self.get_user_by_id(id),
            None => Err(Error::validation(BAD_CREDENTIALS)),
        }
    }

    // --- Tokens ---

    /// Return the user's token, creating one on first use.
    pub fn get_or_create_token(&self, user_id: i64) -> Result<String> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT key FROM auth_tokens WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(key) = existing {
            return Ok(key);
        }

        let key = generate_token();
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO auth_tokens (key, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![key, user_id, now],
        )?;
        Ok(key)
    }

    /// Resolve a token key to its active owner.
    pub fn user_for_token(&self, key: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT u.id, u.email, u.name, u.is_active, u.is_staff, u.is_superuser, u.created_at
                 FROM auth_tokens t JOIN users u ON u.id = t.user_id
                 WHERE t.key = ?1 AND u.is_active = 1",
                params![key],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    // --- Tags & ingredients ---

    /// Explicitly create a tag or ingredient. An existing row with the same
    /// name under the same owner is returned instead of a duplicate.
    pub fn create_attribute(&self, kind: AttributeKind, user_id: i64, name: &str) -> Result<Attribute> {
        validate_name("name", name)?;
        self.get_or_create_attribute(kind, user_id, name)
    }

    /// Names are stored trimmed, so `" Vegan "` and `"Vegan"` are one row.
    /// The UNIQUE (user_id, name) constraint arbitrates concurrent creators:
    /// whoever loses the insert simply reads the winner's row.
    fn get_or_create_attribute(&self, kind: AttributeKind, user_id: i64, name: &str) -> Result<Attribute> {
        let name = name.trim();
        let table = kind.table();
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (user_id, name) VALUES (?1, ?2)
                 ON CONFLICT (user_id, name) DO NOTHING"
            ),
            params![user_id, name],
        )?;
        let attribute = self.conn.query_row(
            &format!("SELECT id, name FROM {table} WHERE user_id = ?1 AND name = ?2"),
            params![user_id, name],
            Self::attribute_from_row,
        )?;
        Ok(attribute)
    }

    pub fn get_attribute(&self, kind: AttributeKind, user_id: i64, id: i64) -> Result<Attribute> {
        self.conn
            .query_row(
                &format!(
                    "SELECT id, name FROM {} WHERE id = ?1 AND user_id = ?2",
                    kind.table()
                ),
                params![id, user_id],
                Self::attribute_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("{} {id}", kind.label())))
    }

    /// All of the owner's tags or ingredients, by name descending.
    ///
    /// With `assigned_only`, rows not linked to any recipe are left out.
    pub fn list_attributes(
        &self,
        kind: AttributeKind,
        user_id: i64,
        assigned_only: bool,
    ) -> Result<Vec<Attribute>> {
        let table = kind.table();
        let sql = if assigned_only {
            format!(
                "SELECT DISTINCT a.id, a.name FROM {table} a
                 JOIN {link} l ON l.{column} = a.id
                 WHERE a.user_id = ?1
                 ORDER BY a.name DESC",
                link = kind.link_table(),
                column = kind.link_column(),
            )
        } else {
            format!("SELECT id, name FROM {table} WHERE user_id = ?1 ORDER BY name DESC")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let attributes = stmt
            .query_map(params![user_id], Self::attribute_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attributes)
    }

    pub fn list_tags(&self, user_id: i64, assigned_only: bool) -> Result<Vec<Tag>> {
        self.list_attributes(AttributeKind::Tag, user_id, assigned_only)
    }

    pub fn list_ingredients(&self, user_id: i64, assigned_only: bool) -> Result<Vec<Ingredient>> {
        self.list_attributes(AttributeKind::Ingredient, user_id, assigned_only)
    }

    pub fn rename_attribute(
        &self,
        kind: AttributeKind,
        user_id: i64,
        id: i64,
        name: &str,
    ) -> Result<Attribute> {
        validate_name("name", name)?;
        let name = name.trim();
        self.get_attribute(kind, user_id, id)?;
        self.conn
            .execute(
                &format!("UPDATE {} SET name = ?1 WHERE id = ?2", kind.table()),
                params![name, id],
            )
            .map_err(Error::from)
            .map_err(|e| {
                if e.is_unique_violation() {
                    Error::validation(format!("{} with this name already exists", kind.label()))
                } else {
                    e
                }
            })?;
        self.get_attribute(kind, user_id, id)
    }

    /// Delete a tag or ingredient. Its recipe links go with it; the recipes stay.
    pub fn delete_attribute(&self, kind: AttributeKind, user_id: i64, id: i64) -> Result<()> {
        self.get_attribute(kind, user_id, id)?;
        let tx = self.conn.unchecked_transaction()?;
        self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                kind.link_table(),
                kind.link_column()
            ),
            params![id],
        )?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn attributes_for_recipe(&self, kind: AttributeKind, recipe_id: i64) -> Result<Vec<Attribute>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT a.id, a.name FROM {table} a
             JOIN {link} l ON l.{column} = a.id
             WHERE l.recipe_id = ?1
             ORDER BY a.id",
            table = kind.table(),
            link = kind.link_table(),
            column = kind.link_column(),
        ))?;
        let attributes = stmt
            .query_map(params![recipe_id], Self::attribute_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attributes)
    }

    fn link_attribute(&self, kind: AttributeKind, recipe_id: i64, attribute_id: i64) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (recipe_id, {}) VALUES (?1, ?2)",
                kind.link_table(),
                kind.link_column()
            ),
            params![recipe_id, attribute_id],
        )?;
        Ok(())
    }

    fn clear_links(&self, kind: AttributeKind, recipe_id: i64) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE recipe_id = ?1", kind.link_table()),
            params![recipe_id],
        )?;
        Ok(())
    }

    /// Resolve each descriptor to the owner's row of that name, creating it
    /// when missing, and link it to the recipe.
    fn reconcile_attributes(
        &self,
        kind: AttributeKind,
        user_id: i64,
        recipe_id: i64,
        descriptors: &[Descriptor],
    ) -> Result<()> {
        for descriptor in descriptors {
            let attribute = self.get_or_create_attribute(kind, user_id, &descriptor.name)?;
            self.link_attribute(kind, recipe_id, attribute.id)?;
        }
        Ok(())
    }

    // --- Recipes ---

    pub fn create_recipe(&self, user_id: i64, recipe: &NewRecipe) -> Result<RecipeDetail> {
        validate_new_recipe(recipe)?;

        let now = Local::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        self.conn.execute(
            "INSERT INTO recipes (user_id, title, time_minutes, price_cents, description, link, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                recipe.title.trim(),
                recipe.time_minutes,
                recipe.price.cents(),
                recipe.description,
                recipe.link,
                now,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.reconcile_attributes(AttributeKind::Tag, user_id, id, &recipe.tags)?;
        self.reconcile_attributes(AttributeKind::Ingredient, user_id, id, &recipe.ingredients)?;
        tx.commit()?;

        self.get_recipe_detail(user_id, id)
    }

    /// Fetch a recipe owned by `user_id`. Someone else's recipe is reported as
    /// not found so its existence is not revealed.
    pub fn get_recipe(&self, user_id: i64, id: i64) -> Result<Recipe> {
        self.conn
            .query_row(
                &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
                Self::recipe_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("Recipe {id}")))
    }

    pub fn get_recipe_detail(&self, user_id: i64, id: i64) -> Result<RecipeDetail> {
        let recipe = self.get_recipe(user_id, id)?;
        let tags = self.attributes_for_recipe(AttributeKind::Tag, id)?;
        let ingredients = self.attributes_for_recipe(AttributeKind::Ingredient, id)?;

        Ok(RecipeDetail {
            id: recipe.id,
            user_id: recipe.user_id,
            title: recipe.title,
            time_minutes: recipe.time_minutes,
            price: recipe.price,
            link: recipe.link,
            description: recipe.description,
            image: recipe.image,
            tags,
            ingredients,
        })
    }

    /// Partial update. Present scalar fields overwrite, absent ones are kept.
    /// A present tag or ingredient list replaces the whole association set.
    pub fn update_recipe(&self, user_id: i64, id: i64, update: &UpdateRecipe) -> Result<RecipeDetail> {
        validate_recipe_update(update)?;
        let mut recipe = self.get_recipe(user_id, id)?;

        if let Some(title) = &update.title {
            title.trim().clone_into(&mut recipe.title);
        }
        if let Some(time_minutes) = update.time_minutes {
            recipe.time_minutes = time_minutes;
        }
        if let Some(price) = update.price {
            recipe.price = price;
        }
        if let Some(description) = &update.description {
            recipe.description.clone_from(description);
        }
        if let Some(link) = &update.link {
            recipe.link.clone_from(link);
        }

        let now = Local::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        self.conn.execute(
            "UPDATE recipes SET title = ?1, time_minutes = ?2, price_cents = ?3, description = ?4,
             link = ?5, updated_at = ?6 WHERE id = ?7",
            params![
                recipe.title,
                recipe.time_minutes,
                recipe.price.cents(),
                recipe.description,
                recipe.link,
                now,
                id,
            ],
        )?;
        if let Some(tags) = &update.tags {
            self.clear_links(AttributeKind::Tag, id)?;
            self.reconcile_attributes(AttributeKind::Tag, user_id, id, tags)?;
        }
        if let Some(ingredients) = &update.ingredients {
            self.clear_links(AttributeKind::Ingredient, id)?;
            self.reconcile_attributes(AttributeKind::Ingredient, user_id, id, ingredients)?;
        }
        tx.commit()?;

        self.get_recipe_detail(user_id, id)
    }

    pub fn set_recipe_image(&self, user_id: i64, id: i64, image: &str) -> Result<Recipe> {
        self.get_recipe(user_id, id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE recipes SET image = ?1, updated_at = ?2 WHERE id = ?3",
            params![image, now, id],
        )?;
        self.get_recipe(user_id, id)
    }

    /// The owner's recipes, newest first.
    ///
    /// Each id filter keeps recipes linked to at least one of the listed ids;
    /// the two filters combine with AND. Filtering goes through `IN`
    /// subqueries rather than joins, so a recipe matching several ids still
    /// appears once. Each id list is bound as a single JSON array, so its
    /// length is not limited by SQLite's variable count.
    pub fn list_recipes(&self, user_id: i64, filter: &RecipeFilter) -> Result<Vec<RecipeDetail>> {
        let mut sql = String::from("SELECT r.id FROM recipes r WHERE r.user_id = ?");
        let mut args = vec![Value::Integer(user_id)];

        for (kind, ids) in [
            (AttributeKind::Tag, &filter.tags),
            (AttributeKind::Ingredient, &filter.ingredients),
        ] {
            if let Some(ids) = ids {
                let _ = write!(
                    sql,
                    " AND r.id IN (SELECT recipe_id FROM {} WHERE {} IN (SELECT value FROM json_each(?)))",
                    kind.link_table(),
                    kind.link_column(),
                );
                args.push(Value::Text(json_id_array(ids)));
            }
        }
        sql.push_str(" ORDER BY r.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let ids: Vec<i64> = stmt
            .query_map(params_from_iter(args), |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut details = Vec::with_capacity(ids.len());
        for id in ids {
            details.push(self.get_recipe_detail(user_id, id)?);
        }
        Ok(details)
    }

    /// Delete a recipe and its association rows. Tags and ingredients survive.
    pub fn delete_recipe(&self, user_id: i64, id: i64) -> Result<()> {
        self.get_recipe(user_id, id)?;
        let tx = self.conn.unchecked_transaction()?;
        self.clear_links(AttributeKind::Tag, id)?;
        self.clear_links(AttributeKind::Ingredient, id)?;
        self.conn
            .execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

fn json_id_array(ids: &[i64]) -> String {
    let mut out = String::from("[");
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{id}");
    }
    out.push(']');
    out
}

fn duplicate_email(err: Error) -> Error {
    if err.is_unique_violation() {
        Error::validation("user with this email already exists")
    } else {
        err
    }
}
