use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = 255;
pub const MIN_PASSWORD_LEN: usize = 5;

// --- Users ---

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub created_at: String,
}

/// Public view of an account. Never carries credentials.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub email: String,
    pub name: String,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            email: user.email.clone(),
            name: user.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub email: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

// --- Tags & ingredients ---

/// Tags and ingredients share one shape: an owned, named row linked to
/// recipes through its own association table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Tag,
    Ingredient,
}

impl AttributeKind {
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Tag => "tags",
            Self::Ingredient => "ingredients",
        }
    }

    #[must_use]
    pub fn link_table(self) -> &'static str {
        match self {
            Self::Tag => "recipe_tags",
            Self::Ingredient => "recipe_ingredients",
        }
    }

    #[must_use]
    pub fn link_column(self) -> &'static str {
        match self {
            Self::Tag => "tag_id",
            Self::Ingredient => "ingredient_id",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Tag => "Tag",
            Self::Ingredient => "Ingredient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: i64,
    pub name: String,
}

pub type Tag = Attribute;
pub type Ingredient = Attribute;

/// A `{name}` reference to a tag or ingredient inside a recipe payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Descriptor {
    pub name: String,
}

impl Descriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// --- Recipes ---

/// Fixed-point money amount stored as hundredths.
///
/// Accepts at most three whole digits and two decimal places, so the range
/// is -999.99..=999.99. Serialized as a string (`"5.25"`) to avoid float
/// round-off on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Price(i64);

impl Price {
    pub const MAX_WHOLE_DIGITS: usize = 3;
    pub const DECIMAL_PLACES: usize = 2;

    #[must_use]
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    #[must_use]
    pub fn cents(self) -> i64 {
        self.0
    }
}

impl FromStr for Price {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (negative, unsigned) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (whole, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
            return Err(Error::validation("price: a valid number is required"));
        }
        if frac.len() > Self::DECIMAL_PLACES {
            return Err(Error::validation(
                "price: ensure that there are no more than 2 decimal places",
            ));
        }
        let whole = whole.trim_start_matches('0');
        if whole.len() > Self::MAX_WHOLE_DIGITS {
            return Err(Error::validation(
                "price: ensure that there are no more than 3 digits before the decimal point",
            ));
        }

        // Both parts are at most three ASCII digits here, so parsing cannot fail.
        let whole_value: i64 = whole.parse().unwrap_or(0);
        let frac_value: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().unwrap_or(0) * 10,
            _ => frac.parse::<i64>().unwrap_or(0),
        };
        let cents = whole_value * 100 + frac_value;
        Ok(Self(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PriceVisitor;

        impl Visitor<'_> for PriceVisitor {
            type Value = Price;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal price as a string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Price, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Price, E> {
                self.visit_str(&v.to_string())
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Price, E> {
                self.visit_str(&v.to_string())
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Price, E> {
                self.visit_str(&v.to_string())
            }
        }

        deserializer.deserialize_any(PriceVisitor)
    }
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub time_minutes: i64,
    pub price: Price,
    pub description: String,
    pub link: String,
    pub image: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeDetail {
    pub id: i64,
    #[serde(skip)]
    pub user_id: i64,
    pub title: String,
    pub time_minutes: i64,
    pub price: Price,
    pub link: String,
    pub description: String,
    pub image: Option<String>,
    pub tags: Vec<Tag>,
    pub ingredients: Vec<Ingredient>,
}

/// List view of a recipe: the detail minus description and image.
#[derive(Debug, Clone, Serialize)]
pub struct RecipeSummary {
    pub id: i64,
    pub title: String,
    pub time_minutes: i64,
    pub price: Price,
    pub link: String,
    pub tags: Vec<Tag>,
    pub ingredients: Vec<Ingredient>,
}

impl From<RecipeDetail> for RecipeSummary {
    fn from(detail: RecipeDetail) -> Self {
        Self {
            id: detail.id,
            title: detail.title,
            time_minutes: detail.time_minutes,
            price: detail.price,
            link: detail.link,
            tags: detail.tags,
            ingredients: detail.ingredients,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRecipe {
    pub title: String,
    pub time_minutes: i64,
    pub price: Price,
    pub description: String,
    pub link: String,
    pub tags: Vec<Descriptor>,
    pub ingredients: Vec<Descriptor>,
}

/// Writable recipe fields. Ownership is not among them and cannot change
/// through an update.
///
/// `None` leaves a field alone. For `tags`/`ingredients`, `Some(vec![])`
/// clears the association set and `Some(items)` replaces it.
#[derive(Debug, Clone, Default)]
pub struct UpdateRecipe {
    pub title: Option<String>,
    pub time_minutes: Option<i64>,
    pub price: Option<Price>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub tags: Option<Vec<Descriptor>>,
    pub ingredients: Option<Vec<Descriptor>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeFilter {
    pub tags: Option<Vec<i64>>,
    pub ingredients: Option<Vec<i64>>,
}

// --- Validation ---

/// Validate a name as it will be stored, i.e. with surrounding whitespace trimmed.
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation(format!("{field} must not be blank")));
    }
    validate_max_len(field, value)
}

pub fn validate_max_len(field: &str, value: &str) -> Result<()> {
    if value.chars().count() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "{field} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_link(link: &str) -> Result<()> {
    validate_max_len("link", link)
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_descriptors(field: &str, descriptors: &[Descriptor]) -> Result<()> {
    for descriptor in descriptors {
        validate_name(&format!("{field}.name"), &descriptor.name)?;
    }
    Ok(())
}

pub fn validate_new_recipe(recipe: &NewRecipe) -> Result<()> {
    validate_name("title", &recipe.title)?;
    validate_link(&recipe.link)?;
    validate_descriptors("tags", &recipe.tags)?;
    validate_descriptors("ingredients", &recipe.ingredients)?;
    Ok(())
}

pub fn validate_recipe_update(update: &UpdateRecipe) -> Result<()> {
    if let Some(title) = &update.title {
        validate_name("title", title)?;
    }
    if let Some(link) = &update.link {
        validate_link(link)?;
    }
    if let Some(tags) = &update.tags {
        validate_descriptors("tags", tags)?;
    }
    if let Some(ingredients) = &update.ingredients {
        validate_descriptors("ingredients", ingredients)?;
    }
    Ok(())
}

// --- Query parameter parsing ---

/// Parse a comma-separated id list such as `"3,7,12"`.
///
/// An empty value means "no filter" and yields `None`. Repeated ids are
/// collapsed and the result is sorted.
pub fn parse_id_list(param: &str, raw: &str) -> Result<Option<Vec<i64>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let ids = raw
        .split(',')
        .map(|part| {
            part.trim().parse::<i64>().map_err(|_| {
                Error::validation(format!("{param}: '{part}' is not a valid integer id"))
            })
        })
        .collect::<Result<BTreeSet<_>>>()?;
    Ok(Some(ids.into_iter().collect()))
}

/// Parse an integer flag such as `assigned_only=1`. Any non-zero value is true.
pub fn parse_flag(param: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<i64>()
        .map(|v| v != 0)
        .map_err(|_| Error::validation(format!("{param}: '{raw}' is not a valid integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_parses_common_forms() {
        assert_eq!("5.25".parse::<Price>().unwrap().cents(), 525);
        assert_eq!("5.5".parse::<Price>().unwrap().cents(), 550);
        assert_eq!("5".parse::<Price>().unwrap().cents(), 500);
        assert_eq!(".5".parse::<Price>().unwrap().cents(), 50);
        assert_eq!("-1.05".parse::<Price>().unwrap().cents(), -105);
        assert_eq!("007.10".parse::<Price>().unwrap().cents(), 710);
    }

    #[test]
    fn test_price_rejects_too_many_decimal_places() {
        let err = "1.234".parse::<Price>().unwrap_err();
        assert!(err.to_string().contains("2 decimal places"));
    }

    #[test]
    fn test_price_rejects_too_many_whole_digits() {
        assert!("999.99".parse::<Price>().is_ok());
        let err = "1000".parse::<Price>().unwrap_err();
        assert!(err.to_string().contains("3 digits"));
    }

    #[test]
    fn test_price_rejects_garbage() {
        for bad in ["", ".", "abc", "1.2.3", "1e3", "NaN", "--1"] {
            assert!(bad.parse::<Price>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_price_display_pads_cents() {
        assert_eq!(Price::from_cents(525).to_string(), "5.25");
        assert_eq!(Price::from_cents(500).to_string(), "5.00");
        assert_eq!(Price::from_cents(7).to_string(), "0.07");
        assert_eq!(Price::from_cents(-105).to_string(), "-1.05");
    }

    #[test]
    fn test_price_deserializes_from_string_and_number() {
        let from_str: Price = serde_json::from_str("\"4.34\"").unwrap();
        let from_float: Price = serde_json::from_str("4.34").unwrap();
        let from_int: Price = serde_json::from_str("4").unwrap();
        assert_eq!(from_str.cents(), 434);
        assert_eq!(from_float.cents(), 434);
        assert_eq!(from_int.cents(), 400);
        assert!(serde_json::from_str::<Price>("\"4.345\"").is_err());
    }

    #[test]
    fn test_price_serializes_as_string() {
        let json = serde_json::to_value(Price::from_cents(1234)).unwrap();
        assert_eq!(json, serde_json::json!("12.34"));
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("tags", "1,2,3").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(parse_id_list("tags", " 4 , 5").unwrap(), Some(vec![4, 5]));
        assert_eq!(parse_id_list("tags", "").unwrap(), None);
    }

    #[test]
    fn test_parse_id_list_collapses_repeats() {
        assert_eq!(parse_id_list("tags", "3,1,3,3").unwrap(), Some(vec![1, 3]));
        let raw = vec!["1"; 40_000].join(",");
        assert_eq!(parse_id_list("tags", &raw).unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_parse_id_list_rejects_non_integers() {
        let err = parse_id_list("ingredients", "1,x").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("ingredients"));
        assert!(parse_id_list("tags", "1,,2").is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("assigned_only", "1").unwrap());
        assert!(!parse_flag("assigned_only", "0").unwrap());
        assert!(parse_flag("assigned_only", "yes").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("title", "Soup").is_ok());
        assert!(validate_name("title", "   ").is_err());
        assert!(validate_name("title", &"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_name_measures_trimmed_value() {
        let padded = format!("  {}  ", "x".repeat(MAX_NAME_LEN));
        assert!(validate_name("title", &padded).is_ok());
    }

    #[test]
    fn test_validate_password_min_length() {
        assert!(validate_password("pw").is_err());
        assert!(validate_password("12345").is_ok());
    }

    #[test]
    fn test_validate_new_recipe_rejects_blank_descriptor() {
        let recipe = NewRecipe {
            title: "Curry".to_string(),
            time_minutes: 30,
            price: Price::from_cents(450),
            description: String::new(),
            link: String::new(),
            tags: vec![Descriptor::new("Vegan"), Descriptor::new("")],
            ingredients: Vec::new(),
        };
        let err = validate_new_recipe(&recipe).unwrap_err();
        assert!(err.to_string().contains("tags.name"));
    }

    #[test]
    fn test_validate_recipe_update_only_checks_present_fields() {
        assert!(validate_recipe_update(&UpdateRecipe::default()).is_ok());
        let update = UpdateRecipe {
            title: Some(String::new()),
            ..UpdateRecipe::default()
        };
        assert!(validate_recipe_update(&update).is_err());
    }

    #[test]
    fn test_descriptor_requires_name() {
        assert!(serde_json::from_str::<Descriptor>("{}").is_err());
        let d: Descriptor = serde_json::from_str(r#"{"name":"Salt"}"#).unwrap();
        assert_eq!(d.name, "Salt");
    }

    #[test]
    fn test_summary_drops_detail_fields() {
        let detail = RecipeDetail {
            id: 1,
            user_id: 9,
            title: "Soup".to_string(),
            time_minutes: 10,
            price: Price::from_cents(100),
            link: String::new(),
            description: "hot".to_string(),
            image: None,
            tags: Vec::new(),
            ingredients: Vec::new(),
        };
        let json = serde_json::to_value(RecipeSummary::from(detail)).unwrap();
        assert!(json.get("description").is_none());
        assert!(json.get("image").is_none());
        assert!(json.get("user_id").is_none());
        assert_eq!(json["price"], "1.00");
    }
}
