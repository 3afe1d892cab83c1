mod attribute;
mod helpers;
mod recipe;
mod user;

pub(crate) use attribute::cmd_attribute_list;
pub(crate) use recipe::cmd_recipe_list;
pub(crate) use user::{cmd_user_create, cmd_user_list, cmd_user_token};
