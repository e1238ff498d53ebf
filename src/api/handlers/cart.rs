//! Cart reads and idempotent cart mutations.
//!
//! Prices are integer cents throughout; totals are computed from the joined
//! product rows at read time, never stored on the cart.

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Path},
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

use super::auth::guard::require_auth;
use super::auth::AuthState;
use super::auth::storage::PgSessionStore;
use super::{success, with_rotated_cookie};
use crate::api::error::ApiError;
use crate::api::idempotency::{self, IdempotentAction, PgIdempotencyStore, StoredResponse};

#[derive(ToSchema, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AddCartItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CartItemView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub quantity: i32,
    pub line_total_cents: i64,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub id: Uuid,
    pub items: Vec<CartItemView>,
    pub total_cents: i64,
}

/// Each user owns exactly one cart; create it lazily on first touch.
pub(crate) async fn ensure_cart(pool: &PgPool, user_id: Uuid) -> Result<Uuid> {
    let query = r"
        INSERT INTO carts (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to ensure cart")?;

    let query = "SELECT id FROM carts WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to load cart id")?;
    Ok(row.get("id"))
}

pub(crate) async fn load_cart(pool: &PgPool, user_id: Uuid) -> Result<CartView> {
    let cart_id = ensure_cart(pool, user_id).await?;

    let query = r"
        SELECT i.id, i.product_id, i.quantity, p.name, p.price_cents
        FROM cart_items i
        JOIN products p ON p.id = i.product_id
        WHERE i.cart_id = $1
        ORDER BY i.created_at ASC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(cart_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load cart items")?;

    let items: Vec<CartItemView> = rows
        .iter()
        .map(|row| {
            let price_cents: i64 = row.get("price_cents");
            let quantity: i32 = row.get("quantity");
            CartItemView {
                id: row.get("id"),
                product_id: row.get("product_id"),
                name: row.get("name"),
                price_cents,
                quantity,
                line_total_cents: price_cents * i64::from(quantity),
            }
        })
        .collect();
    let total_cents = items.iter().map(|item| item.line_total_cents).sum();

    Ok(CartView {
        id: cart_id,
        items,
        total_cents,
    })
}

async fn product_exists(pool: &PgPool, product_id: Uuid) -> Result<bool> {
    let query = "SELECT 1 AS one FROM products WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(product_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check product")?;
    Ok(row.is_some())
}

async fn upsert_item(pool: &PgPool, cart_id: Uuid, product_id: Uuid, quantity: i32) -> Result<()> {
    // Re-adding a product accumulates quantity instead of duplicating rows.
    let query = r"
        INSERT INTO cart_items (cart_id, product_id, quantity)
        VALUES ($1, $2, $3)
        ON CONFLICT (cart_id, product_id)
        DO UPDATE SET quantity = cart_items.quantity + EXCLUDED.quantity
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(cart_id)
        .bind(product_id)
        .bind(quantity)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to upsert cart item")?;
    Ok(())
}

async fn set_item_quantity(
    pool: &PgPool,
    cart_id: Uuid,
    item_id: Uuid,
    quantity: i32,
) -> Result<bool> {
    let query = r"
        UPDATE cart_items
        SET quantity = $3
        WHERE id = $2 AND cart_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(cart_id)
        .bind(item_id)
        .bind(quantity)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update cart item")?;
    Ok(result.rows_affected() > 0)
}

async fn remove_item(pool: &PgPool, cart_id: Uuid, item_id: Uuid) -> Result<bool> {
    let query = "DELETE FROM cart_items WHERE id = $2 AND cart_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(cart_id)
        .bind(item_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete cart item")?;
    Ok(result.rows_affected() > 0)
}

#[utoipa::path(
    get,
    path = "/v1/cart",
    responses(
        (status = 200, description = "The signed-in user's cart", body = CartView),
        (status = 401, description = "Not signed in")
    ),
    tag = "cart"
)]
pub async fn get_cart(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let response = match load_cart(&pool.0, auth.identity.user_id).await {
        Ok(cart) => {
            let body = success(serde_json::json!({ "cart": cart }));
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => ApiError::Internal(err).into_response(),
    };
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[utoipa::path(
    post,
    path = "/v1/cart/items",
    request_body = AddCartItemRequest,
    params(
        ("idempotency-key" = Option<String>, Header, description = "Client retry nonce")
    ),
    responses(
        (status = 201, description = "Item added; response replayed on retries", body = CartView),
        (status = 400, description = "Invalid quantity or idempotency key"),
        (status = 404, description = "Unknown product"),
        (status = 409, description = "Same key still in flight")
    ),
    tag = "cart"
)]
pub async fn add_cart_item(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<AddCartItemRequest>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let user_id = auth.identity.user_id;

    let key = match idempotency::derive_key(IdempotentAction::CartItemAdd, user_id, &headers) {
        Ok(key) => key,
        Err(err) => return with_rotated_cookie(err.into_response(), auth.rotated_access_cookie),
    };

    let store = PgIdempotencyStore::new(pool.0.clone());
    let result = idempotency::execute(&store, &key, user_id, IdempotentAction::CartItemAdd, || {
        let pool = pool.0.clone();
        async move {
            if request.quantity < 1 {
                return Err(ApiError::Validation(
                    "Quantity must be at least 1".to_string(),
                ));
            }
            if !product_exists(&pool, request.product_id).await? {
                return Err(ApiError::NotFound("Product not found".to_string()));
            }
            let cart_id = ensure_cart(&pool, user_id).await?;
            upsert_item(&pool, cart_id, request.product_id, request.quantity).await?;
            let cart = load_cart(&pool, user_id).await?;
            StoredResponse::json(
                StatusCode::CREATED,
                &success(serde_json::json!({ "cart": cart })),
            )
            .map_err(ApiError::Internal)
        }
    })
    .await;

    let response = match result {
        Ok(stored) => stored.into_response(),
        Err(err) => err.into_response(),
    };
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[utoipa::path(
    patch,
    path = "/v1/cart/items/{id}",
    request_body = UpdateCartItemRequest,
    params(("id" = Uuid, Path, description = "Cart item id")),
    responses(
        (status = 200, description = "Quantity updated", body = CartView),
        (status = 400, description = "Invalid quantity"),
        (status = 404, description = "No such item in this cart")
    ),
    tag = "cart"
)]
pub async fn update_cart_item(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateCartItemRequest>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let result = async {
        if request.quantity < 1 {
            return Err(ApiError::Validation(
                "Quantity must be at least 1".to_string(),
            ));
        }
        let cart_id = ensure_cart(&pool.0, auth.identity.user_id).await?;
        if !set_item_quantity(&pool.0, cart_id, item_id, request.quantity).await? {
            return Err(ApiError::NotFound("Cart item not found".to_string()));
        }
        let cart = load_cart(&pool.0, auth.identity.user_id).await?;
        Ok((
            StatusCode::OK,
            Json(success(serde_json::json!({ "cart": cart }))),
        )
            .into_response())
    }
    .await;

    let response = result.unwrap_or_else(|err: ApiError| err.into_response());
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[utoipa::path(
    delete,
    path = "/v1/cart/items/{id}",
    params(("id" = Uuid, Path, description = "Cart item id")),
    responses(
        (status = 204, description = "Item removed"),
        (status = 404, description = "No such item in this cart")
    ),
    tag = "cart"
)]
pub async fn delete_cart_item(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(item_id): Path<Uuid>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let result = async {
        let cart_id = ensure_cart(&pool.0, auth.identity.user_id).await?;
        if !remove_item(&pool.0, cart_id, item_id).await? {
            return Err(ApiError::NotFound("Cart item not found".to_string()));
        }
        Ok(StatusCode::NO_CONTENT.into_response())
    }
    .await;

    let response = result.unwrap_or_else(|err: ApiError| err.into_response());
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_view_serializes_camel_case() {
        let cart = CartView {
            id: Uuid::nil(),
            items: vec![CartItemView {
                id: Uuid::nil(),
                product_id: Uuid::nil(),
                name: "Mug".to_string(),
                price_cents: 1250,
                quantity: 2,
                line_total_cents: 2500,
            }],
            total_cents: 2500,
        };
        let value = serde_json::to_value(&cart).unwrap();
        assert_eq!(value["totalCents"], 2500);
        assert_eq!(value["items"][0]["priceCents"], 1250);
        assert_eq!(value["items"][0]["lineTotalCents"], 2500);
    }

    #[test]
    fn add_request_accepts_camel_case() {
        let request: AddCartItemRequest = serde_json::from_value(serde_json::json!({
            "productId": "2c8c27b5-8a7e-4a57-a2a2-6f41e1d5bd6e",
            "quantity": 3,
        }))
        .unwrap();
        assert_eq!(request.quantity, 3);
    }
}
