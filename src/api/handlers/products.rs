//! Catalog reads and admin product management.
//!
//! Listing is public so the storefront can render without a session; creating
//! products is admin-only.

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::Instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::guard::{require_auth, require_role};
use super::auth::storage::PgSessionStore;
use super::auth::types::Role;
use super::auth::AuthState;
use super::{success, with_rotated_cookie};
use crate::api::error::{ApiError, ApiResult};

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    pub name: String,
    pub description: String,
    pub price_cents: i64,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub price_cents: i64,
}

impl CreateProductRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::Validation(
                "Product name must not be empty".to_string(),
            ));
        }
        if self.price_cents < 0 {
            return Err(ApiError::Validation(
                "Price must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn product_from_row(row: &sqlx::postgres::PgRow) -> ProductView {
    ProductView {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        price_cents: row.get("price_cents"),
    }
}

async fn load_products(pool: &PgPool) -> Result<Vec<ProductView>> {
    let query = r"
        SELECT id, name, description, price_cents
        FROM products
        ORDER BY created_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load products")?;

    Ok(rows.iter().map(product_from_row).collect())
}

async fn insert_product(pool: &PgPool, request: &CreateProductRequest) -> Result<ProductView> {
    let query = r"
        INSERT INTO products (name, description, price_cents)
        VALUES ($1, $2, $3)
        RETURNING id, name, description, price_cents
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.price_cents)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to insert product")?;

    Ok(product_from_row(&row))
}

#[utoipa::path(
    get,
    path = "/v1/products",
    responses(
        (status = 200, description = "Every product in the catalog", body = [ProductView])
    ),
    tag = "products"
)]
pub async fn list_products(pool: Extension<PgPool>) -> ApiResult<Response> {
    let products = load_products(&pool.0).await?;
    let body = success(serde_json::json!({ "products": products }));
    Ok((StatusCode::OK, Json(body)).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/products",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = ProductView),
        (status = 400, description = "Empty name or negative price"),
        (status = 401, description = "Not signed in"),
        (status = 403, description = "Not an admin")
    ),
    tag = "products"
)]
pub async fn create_product(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<CreateProductRequest>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let result = async {
        require_role(&auth.identity, Role::Admin)?;
        request.validate()?;
        let product = insert_product(&pool.0, &request).await?;
        Ok((
            StatusCode::CREATED,
            Json(success(serde_json::json!({ "product": product }))),
        )
            .into_response())
    }
    .await;

    let response = result.unwrap_or_else(|err: ApiError| err.into_response());
    with_rotated_cookie(response, auth.rotated_access_cookie)
}
