use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get, post, put},
};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::signal;
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use cookbook_core::Error as CoreError;
use cookbook_core::auth::{BAD_CREDENTIALS, HashedUser, ProfileChanges};
use cookbook_core::db::Database;
use cookbook_core::media::ImageStore;
use cookbook_core::models::{
    Attribute, AttributeKind, Descriptor, NewRecipe, NewUser, Price, RecipeDetail, RecipeFilter,
    RecipeSummary, UpdateRecipe, UpdateUser, User, UserProfile, parse_flag, parse_id_list,
};

const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

/// URL prefix under which the media directory is served.
const MEDIA_URL: &str = "/static/media";

/// An id path segment. Anything that is not an integer is answered with 404.
type IdPath = Result<Path<i64>, PathRejection>;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    images: ImageStore,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

fn required(field: &str) -> ApiError {
    ApiError::BadRequest(format!("{field}: this field is required"))
}

#[derive(Deserialize)]
struct CreateUserRequest {
    email: String,
    password: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct TokenRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct UpdateUserRequest {
    email: Option<String>,
    password: Option<String>,
    name: Option<String>,
}

impl UpdateUserRequest {
    fn into_update(self, full: bool) -> Result<UpdateUser, ApiError> {
        if full {
            for (field, present) in [
                ("email", self.email.is_some()),
                ("password", self.password.is_some()),
                ("name", self.name.is_some()),
            ] {
                if !present {
                    return Err(required(field));
                }
            }
        }
        Ok(UpdateUser {
            email: self.email,
            password: self.password,
            name: self.name,
        })
    }
}

/// Recipe write payload shared by create, PUT and PATCH.
///
/// `tags`/`ingredients` distinguish an absent key (`None`) from an explicit
/// `null` (`Some(None)`), which is rejected. There is no owner field, so an
/// attempt to reassign a recipe is dropped here.
#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct RecipeRequest {
    title: Option<String>,
    time_minutes: Option<i64>,
    price: Option<Price>,
    description: Option<String>,
    link: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    tags: Option<Option<Vec<Descriptor>>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    ingredients: Option<Option<Vec<Descriptor>>>,
}

#[allow(clippy::option_option)]
fn descriptor_list(
    field: &str,
    value: Option<Option<Vec<Descriptor>>>,
) -> Result<Option<Vec<Descriptor>>, ApiError> {
    match value {
        Some(None) => Err(ApiError::BadRequest(format!(
            "{field}: this field may not be null"
        ))),
        Some(Some(items)) => Ok(Some(items)),
        None => Ok(None),
    }
}

impl RecipeRequest {
    fn into_new_recipe(self) -> Result<NewRecipe, ApiError> {
        Ok(NewRecipe {
            title: self.title.ok_or_else(|| required("title"))?,
            time_minutes: self.time_minutes.ok_or_else(|| required("time_minutes"))?,
            price: self.price.ok_or_else(|| required("price"))?,
            description: self.description.unwrap_or_default(),
            link: self.link.unwrap_or_default(),
            tags: descriptor_list("tags", self.tags)?.unwrap_or_default(),
            ingredients: descriptor_list("ingredients", self.ingredients)?.unwrap_or_default(),
        })
    }

    /// With `full` (PUT) the required scalar fields must be present; the rest
    /// behave as in a partial update.
    fn into_update(self, full: bool) -> Result<UpdateRecipe, ApiError> {
        if full {
            if self.title.is_none() {
                return Err(required("title"));
            }
            if self.time_minutes.is_none() {
                return Err(required("time_minutes"));
            }
            if self.price.is_none() {
                return Err(required("price"));
            }
        }
        Ok(UpdateRecipe {
            title: self.title,
            time_minutes: self.time_minutes,
            price: self.price,
            description: self.description,
            link: self.link,
            tags: descriptor_list("tags", self.tags)?,
            ingredients: descriptor_list("ingredients", self.ingredients)?,
        })
    }
}

#[derive(Deserialize)]
struct RecipeListQuery {
    tags: Option<String>,
    ingredients: Option<String>,
}

impl RecipeListQuery {
    fn into_filter(self) -> Result<RecipeFilter, ApiError> {
        let ids = |param: &str, raw: Option<String>| match raw {
            Some(raw) => parse_id_list(param, &raw),
            None => Ok(None),
        };
        Ok(RecipeFilter {
            tags: ids("tags", self.tags)?,
            ingredients: ids("ingredients", self.ingredients)?,
        })
    }
}

#[derive(Deserialize)]
struct AssignedQuery {
    assigned_only: Option<String>,
}

#[derive(Deserialize)]
struct AttributeRequest {
    name: Option<String>,
}

#[derive(Serialize)]
struct ImageResponse {
    id: i64,
    image: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn media_url(relative: &str) -> String {
    format!("{MEDIA_URL}/{relative}")
}

fn with_media_url(mut detail: RecipeDetail) -> RecipeDetail {
    detail.image = detail.image.as_deref().map(media_url);
    detail
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(&'static str),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => {
                let mut response =
                    (StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: msg.to_string() }))
                        .into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Token"));
                return response;
            }
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::BadRequest(msg),
            CoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(_: PathRejection) -> Self {
        Self::NotFound("Not found".to_string())
    }
}

/// Run password hashing or verification on the blocking pool, away from the
/// async workers and outside the database lock.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> cookbook_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(work)
        .await
        .context("blocking task failed")?;
    Ok(result?)
}

// --- Middleware ---

/// Resolve `Authorization: Token <key>` to an active user and attach it to
/// the request.
async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("token"))
        .map(|(_, key)| key.trim().to_string())
        .ok_or(ApiError::Unauthorized(
            "Authentication credentials were not provided.",
        ))?;

    let user = state
        .db()
        .user_for_token(&key)?
        .ok_or(ApiError::Unauthorized("Invalid token."))?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- User handlers ---

async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserProfile>), ApiError> {
    let Json(req) = payload?;
    let new_user = NewUser {
        email: req.email,
        password: req.password,
        name: req.name,
    };
    let prepared = blocking(move || HashedUser::prepare(&new_user)).await?;
    let user = state.db().register(&prepared)?;
    info!(user_id = user.id, "created user");
    Ok((StatusCode::CREATED, Json(UserProfile::from(&user))))
}

async fn create_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(req) = payload?;
    let credentials = state.db().login_credentials(&req.email)?;
    let password = req.password;
    let user_id = blocking(move || Ok(credentials.and_then(|c| c.verify(&password))))
        .await?
        .ok_or_else(|| ApiError::BadRequest(BAD_CREDENTIALS.to_string()))?;
    let token = state.db().get_or_create_token(user_id)?;
    Ok(Json(TokenResponse { token }))
}

async fn get_me(Extension(user): Extension<User>) -> Json<UserProfile> {
    Json(UserProfile::from(&user))
}

async fn put_me(
    state: State<AppState>,
    user: Extension<User>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserProfile>, ApiError> {
    update_me(state, user, payload, true).await
}

async fn patch_me(
    state: State<AppState>,
    user: Extension<User>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserProfile>, ApiError> {
    update_me(state, user, payload, false).await
}

async fn update_me(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
    full: bool,
) -> Result<Json<UserProfile>, ApiError> {
    let Json(req) = payload?;
    let update = req.into_update(full)?;
    let changes = blocking(move || ProfileChanges::prepare(&update)).await?;
    let updated = state.db().apply_profile_changes(user.id, &changes)?;
    Ok(Json(UserProfile::from(&updated)))
}

// --- Recipe handlers ---

async fn list_recipes(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<RecipeListQuery>,
) -> Result<Json<Vec<RecipeSummary>>, ApiError> {
    let filter = query.into_filter()?;
    let recipes = state.db().list_recipes(user.id, &filter)?;
    Ok(Json(recipes.into_iter().map(RecipeSummary::from).collect()))
}

async fn create_recipe(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    payload: Result<Json<RecipeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RecipeDetail>), ApiError> {
    let Json(req) = payload?;
    let new_recipe = req.into_new_recipe()?;
    let recipe = state.db().create_recipe(user.id, &new_recipe)?;
    Ok((StatusCode::CREATED, Json(with_media_url(recipe))))
}

async fn get_recipe(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    id: IdPath,
) -> Result<Json<RecipeDetail>, ApiError> {
    let Path(id) = id?;
    let recipe = state.db().get_recipe_detail(user.id, id)?;
    Ok(Json(with_media_url(recipe)))
}

async fn put_recipe(
    state: State<AppState>,
    user: Extension<User>,
    id: IdPath,
    payload: Result<Json<RecipeRequest>, JsonRejection>,
) -> Result<Json<RecipeDetail>, ApiError> {
    update_recipe(state, user, id, payload, true).await
}

async fn patch_recipe(
    state: State<AppState>,
    user: Extension<User>,
    id: IdPath,
    payload: Result<Json<RecipeRequest>, JsonRejection>,
) -> Result<Json<RecipeDetail>, ApiError> {
    update_recipe(state, user, id, payload, false).await
}

async fn update_recipe(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    id: IdPath,
    payload: Result<Json<RecipeRequest>, JsonRejection>,
    full: bool,
) -> Result<Json<RecipeDetail>, ApiError> {
    let Path(id) = id?;
    let Json(req) = payload?;
    let update = req.into_update(full)?;
    let recipe = state.db().update_recipe(user.id, id, &update)?;
    Ok(Json(with_media_url(recipe)))
}

async fn delete_recipe(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    id: IdPath,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;
    state.db().delete_recipe(user.id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_recipe_image(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    id: IdPath,
    mut multipart: Multipart,
) -> Result<Json<ImageResponse>, ApiError> {
    let Path(id) = id?;
    state.db().get_recipe(user.id, id)?;

    let mut data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            data = Some(bytes);
        }
    }
    let data = data.ok_or_else(|| ApiError::BadRequest("image: no file was submitted".to_string()))?;

    let relative = attach_recipe_image(&state, user.id, id, &data)?;
    info!(recipe_id = id, image = %relative, "stored recipe image");

    Ok(Json(ImageResponse {
        id,
        image: media_url(&relative),
    }))
}

/// Write the file, then point the recipe at it. If the recipe cannot be
/// updated the file is removed again.
fn attach_recipe_image(
    state: &AppState,
    user_id: i64,
    id: i64,
    data: &[u8],
) -> Result<String, ApiError> {
    let relative = state.images.save_recipe_image(data)?;
    let stored = state.db().set_recipe_image(user_id, id, &relative);
    if let Err(err) = stored {
        if let Err(cleanup) = state.images.remove(&relative) {
            warn!(image = %relative, "failed to remove orphaned image: {cleanup}");
        }
        return Err(err.into());
    }
    Ok(relative)
}

// --- Tag & ingredient handlers ---

async fn list_attributes(
    kind: AttributeKind,
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<AssignedQuery>,
) -> Result<Json<Vec<Attribute>>, ApiError> {
    let assigned_only = match query.assigned_only.as_deref() {
        Some(raw) => parse_flag("assigned_only", raw)?,
        None => false,
    };
    let attributes = state.db().list_attributes(kind, user.id, assigned_only)?;
    Ok(Json(attributes))
}

async fn create_attribute(
    kind: AttributeKind,
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    payload: Result<Json<AttributeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Attribute>), ApiError> {
    let Json(req) = payload?;
    let name = req.name.ok_or_else(|| required("name"))?;
    let attribute = state.db().create_attribute(kind, user.id, &name)?;
    Ok((StatusCode::CREATED, Json(attribute)))
}

async fn rename_attribute(
    kind: AttributeKind,
    full: bool,
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    id: IdPath,
    payload: Result<Json<AttributeRequest>, JsonRejection>,
) -> Result<Json<Attribute>, ApiError> {
    let Path(id) = id?;
    let Json(req) = payload?;
    let db = state.db();
    let attribute = match req.name {
        Some(name) => db.rename_attribute(kind, user.id, id, &name)?,
        None if full => return Err(required("name")),
        None => db.get_attribute(kind, user.id, id)?,
    };
    Ok(Json(attribute))
}

async fn delete_attribute(
    kind: AttributeKind,
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    id: IdPath,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;
    state.db().delete_attribute(kind, user.id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn attribute_collection(kind: AttributeKind) -> MethodRouter<AppState> {
    get(
        move |state: State<AppState>, user: Extension<User>, query: Query<AssignedQuery>| {
            list_attributes(kind, state, user, query)
        },
    )
    .post(
        move |state: State<AppState>,
              user: Extension<User>,
              payload: Result<Json<AttributeRequest>, JsonRejection>| {
            create_attribute(kind, state, user, payload)
        },
    )
}

fn attribute_member(kind: AttributeKind) -> MethodRouter<AppState> {
    put(
        move |state: State<AppState>,
              user: Extension<User>,
              id: IdPath,
              payload: Result<Json<AttributeRequest>, JsonRejection>| {
            rename_attribute(kind, true, state, user, id, payload)
        },
    )
    .patch(
        move |state: State<AppState>,
              user: Extension<User>,
              id: IdPath,
              payload: Result<Json<AttributeRequest>, JsonRejection>| {
            rename_attribute(kind, false, state, user, id, payload)
        },
    )
    .delete(
        move |state: State<AppState>, user: Extension<User>, id: IdPath| {
            delete_attribute(kind, state, user, id)
        },
    )
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/user/me", get(get_me).put(put_me).patch(patch_me))
        .route("/api/recipe/recipes", get(list_recipes).post(create_recipe))
        .route(
            "/api/recipe/recipes/{id}",
            get(get_recipe)
                .put(put_recipe)
                .patch(patch_recipe)
                .delete(delete_recipe),
        )
        .route(
            "/api/recipe/recipes/{id}/upload-image",
            post(upload_recipe_image),
        )
        .route("/api/recipe/tags", attribute_collection(AttributeKind::Tag))
        .route("/api/recipe/tags/{id}", attribute_member(AttributeKind::Tag))
        .route(
            "/api/recipe/ingredients",
            attribute_collection(AttributeKind::Ingredient),
        )
        .route(
            "/api/recipe/ingredients/{id}",
            attribute_member(AttributeKind::Ingredient),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/api/user/create", post(create_user))
        .route("/api/user/token", post(create_token))
        .merge(protected)
        .nest_service(MEDIA_URL, ServeDir::new(state.images.root()))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    images: ImageStore,
    port: u16,
    bind: &str,
) -> anyhow::Result<()> {
    let media_root = images.root().display().to_string();
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        images,
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("Listening on http://{bind}:{port}");
    info!("Serving media from {media_root} at {MEDIA_URL}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
