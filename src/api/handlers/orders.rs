//! Order placement, listing, and admin status transitions.
//!
//! Placement is the heavyweight idempotent flow: it snapshots the cart,
//! writes the order and its items, clears the cart, and enqueues the
//! confirmation email, all in one transaction. Retrying the same
//! idempotency key replays the recorded response instead of placing a
//! second order.

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{info, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::guard::{require_auth, require_role};
use super::auth::storage::PgSessionStore;
use super::auth::types::Role;
use super::auth::AuthState;
use super::{success, with_rotated_cookie};
use crate::api::email::{self, JobOptions};
use crate::api::error::ApiError;
use crate::api::idempotency::{self, IdempotentAction, PgIdempotencyStore, StoredResponse};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Canceled,
    Shipped,
    Delivered,
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Canceled => "canceled",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
        }
    }

    #[must_use]
    pub fn from_db(value: &str) -> Self {
        match value {
            "canceled" => Self::Canceled,
            "shipped" => Self::Shipped,
            "delivered" => Self::Delivered,
            _ => Self::Pending,
        }
    }

    /// Allowed lifecycle moves. Everything else is rejected, including
    /// no-op transitions to the current status.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Canceled)
                | (Self::Pending, Self::Shipped)
                | (Self::Shipped, Self::Delivered)
        )
    }
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub quantity: i32,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItemView>,
}

struct CartLine {
    product_id: Uuid,
    name: String,
    price_cents: i64,
    quantity: i32,
}

async fn place_order(pool: &PgPool, user_id: Uuid, email_to: &str) -> Result<OrderView, ApiError> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start order transaction")?;

    let query = r"
        SELECT i.product_id, i.quantity, p.name, p.price_cents
        FROM cart_items i
        JOIN carts c ON c.id = i.cart_id
        JOIN products p ON p.id = i.product_id
        WHERE c.user_id = $1
        ORDER BY i.created_at ASC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load cart for order")?;

    let lines: Vec<CartLine> = rows
        .iter()
        .map(|row| CartLine {
            product_id: row.get("product_id"),
            name: row.get("name"),
            price_cents: row.get("price_cents"),
            quantity: row.get("quantity"),
        })
        .collect();

    if lines.is_empty() {
        return Err(ApiError::Validation("Your cart is empty".to_string()));
    }

    let total_cents: i64 = lines
        .iter()
        .map(|line| line.price_cents * i64::from(line.quantity))
        .sum();

    let query = r"
        INSERT INTO orders (user_id, status, total_cents)
        VALUES ($1, 'pending', $2)
        RETURNING id, created_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(total_cents)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert order")?;
    let order_id: Uuid = row.get("id");
    let created_at: DateTime<Utc> = row.get("created_at");

    for line in &lines {
        // Price is copied onto the item so later catalog changes do not
        // rewrite order history.
        let query = r"
            INSERT INTO order_items (order_id, product_id, name, price_cents, quantity)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(order_id)
            .bind(line.product_id)
            .bind(&line.name)
            .bind(line.price_cents)
            .bind(line.quantity)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert order item")?;
    }

    let query = r"
        DELETE FROM cart_items
        WHERE cart_id IN (SELECT id FROM carts WHERE user_id = $1)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to clear cart after order")?;

    // Confirmation rides the same transaction: no order without its email
    // job and no email job without its order.
    let payload = serde_json::json!({
        "orderId": order_id,
        "totalCents": total_cents,
    });
    email::submit(
        &mut *tx,
        email_to,
        "order_confirmation",
        &payload,
        JobOptions::new().with_priority(10),
    )
    .await?;

    tx.commit()
        .await
        .context("failed to commit order transaction")?;

    info!(%order_id, user_id = %user_id, total_cents, "Order placed");

    Ok(OrderView {
        id: order_id,
        status: OrderStatus::Pending,
        total_cents,
        created_at,
        items: lines
            .into_iter()
            .map(|line| OrderItemView {
                product_id: line.product_id,
                name: line.name,
                price_cents: line.price_cents,
                quantity: line.quantity,
            })
            .collect(),
    })
}

async fn load_order_items(pool: &PgPool, order_ids: &[Uuid]) -> Result<Vec<(Uuid, OrderItemView)>> {
    let query = r"
        SELECT order_id, product_id, name, price_cents, quantity
        FROM order_items
        WHERE order_id = ANY($1)
        ORDER BY name ASC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(order_ids)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load order items")?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get("order_id"),
                OrderItemView {
                    product_id: row.get("product_id"),
                    name: row.get("name"),
                    price_cents: row.get("price_cents"),
                    quantity: row.get("quantity"),
                },
            )
        })
        .collect())
}

async fn load_orders(pool: &PgPool, user_id: Uuid) -> Result<Vec<OrderView>> {
    let query = r"
        SELECT id, status, total_cents, created_at
        FROM orders
        WHERE user_id = $1
        ORDER BY created_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load orders")?;

    let mut orders: Vec<OrderView> = rows
        .iter()
        .map(|row| {
            let status: String = row.get("status");
            OrderView {
                id: row.get("id"),
                status: OrderStatus::from_db(&status),
                total_cents: row.get("total_cents"),
                created_at: row.get("created_at"),
                items: Vec::new(),
            }
        })
        .collect();

    if orders.is_empty() {
        return Ok(orders);
    }

    let ids: Vec<Uuid> = orders.iter().map(|order| order.id).collect();
    for (order_id, item) in load_order_items(pool, &ids).await? {
        if let Some(order) = orders.iter_mut().find(|order| order.id == order_id) {
            order.items.push(item);
        }
    }
    Ok(orders)
}

/// Load one order; customers only see their own, admins see any.
async fn load_order(
    pool: &PgPool,
    order_id: Uuid,
    user_id: Uuid,
    role: Role,
) -> Result<Option<OrderView>> {
    let query = r"
        SELECT id, user_id, status, total_cents, created_at
        FROM orders
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(order_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load order")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let owner: Uuid = row.get("user_id");
    if owner != user_id && role != Role::Admin {
        // Hide other users' orders entirely.
        return Ok(None);
    }

    let status: String = row.get("status");
    let mut order = OrderView {
        id: row.get("id"),
        status: OrderStatus::from_db(&status),
        total_cents: row.get("total_cents"),
        created_at: row.get("created_at"),
        items: Vec::new(),
    };
    for (_, item) in load_order_items(pool, &[order.id]).await? {
        order.items.push(item);
    }
    Ok(Some(order))
}

#[utoipa::path(
    post,
    path = "/v1/orders",
    params(
        ("idempotency-key" = Option<String>, Header, description = "Client retry nonce")
    ),
    responses(
        (status = 201, description = "Order placed; response replayed on retries", body = OrderView),
        (status = 400, description = "Cart is empty or idempotency key malformed"),
        (status = 409, description = "Same key still in flight")
    ),
    tag = "orders"
)]
pub async fn create_order(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let user_id = auth.identity.user_id;

    let key = match idempotency::derive_key(IdempotentAction::OrderPlacement, user_id, &headers) {
        Ok(key) => key,
        Err(err) => return with_rotated_cookie(err.into_response(), auth.rotated_access_cookie),
    };

    let store = PgIdempotencyStore::new(pool.0.clone());
    let email_to = auth.identity.email.clone();
    let result = idempotency::execute(&store, &key, user_id, IdempotentAction::OrderPlacement, || {
        let pool = pool.0.clone();
        async move {
            let order = place_order(&pool, user_id, &email_to).await?;
            StoredResponse::json(
                StatusCode::CREATED,
                &success(serde_json::json!({ "order": order })),
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
    get,
    path = "/v1/orders",
    responses(
        (status = 200, description = "The signed-in user's orders", body = [OrderView]),
        (status = 401, description = "Not signed in")
    ),
    tag = "orders"
)]
pub async fn list_orders(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let response = match load_orders(&pool.0, auth.identity.user_id).await {
        Ok(orders) => {
            let body = success(serde_json::json!({ "orders": orders }));
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => ApiError::Internal(err).into_response(),
    };
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[utoipa::path(
    get,
    path = "/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order detail", body = OrderView),
        (status = 404, description = "No such order for this user")
    ),
    tag = "orders"
)]
pub async fn get_order(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(order_id): Path<Uuid>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let result = load_order(
        &pool.0,
        order_id,
        auth.identity.user_id,
        auth.identity.role,
    )
    .await;
    let response = match result {
        Ok(Some(order)) => {
            let body = success(serde_json::json!({ "order": order }));
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(None) => ApiError::NotFound("Order not found".to_string()).into_response(),
        Err(err) => ApiError::Internal(err).into_response(),
    };
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[utoipa::path(
    patch,
    path = "/v1/orders/{id}/status",
    request_body = UpdateOrderStatusRequest,
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Status updated", body = OrderView),
        (status = 400, description = "Transition not allowed"),
        (status = 403, description = "Admin only"),
        (status = 404, description = "No such order")
    ),
    tag = "orders"
)]
pub async fn update_order_status(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let result = async {
        require_role(&auth.identity, Role::Admin)?;

        let current = load_order(
            &pool.0,
            order_id,
            auth.identity.user_id,
            auth.identity.role,
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("Order not found".to_string()))?;

        if !current.status.can_transition_to(request.status) {
            return Err(ApiError::Validation(format!(
                "Cannot change order status from {} to {}",
                current.status.as_str(),
                request.status.as_str()
            )));
        }

        let query = "UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(order_id)
            .bind(request.status.as_str())
            .execute(&pool.0)
            .instrument(span)
            .await
            .context("failed to update order status")?;

        let mut order = current;
        order.status = request.status;
        Ok((
            StatusCode::OK,
            Json(success(serde_json::json!({ "order": order }))),
        )
            .into_response())
    }
    .await;

    let response = result.unwrap_or_else(|err: ApiError| err.into_response());
    with_rotated_cookie(response, auth.rotated_access_cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Canceled));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
    }

    #[test]
    fn forbidden_transitions() {
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Canceled.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Canceled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Canceled,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ] {
            assert_eq!(OrderStatus::from_db(status.as_str()), status);
        }
        assert_eq!(OrderStatus::from_db("garbage"), OrderStatus::Pending);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(OrderStatus::Shipped).unwrap(),
            "shipped"
        );
        let request: UpdateOrderStatusRequest =
            serde_json::from_value(serde_json::json!({"status": "canceled"})).unwrap();
        assert_eq!(request.status, OrderStatus::Canceled);
    }

    #[test]
    fn order_view_serializes_camel_case() {
        let order = OrderView {
            id: Uuid::nil(),
            status: OrderStatus::Pending,
            total_cents: 4200,
            created_at: Utc::now(),
            items: vec![],
        };
        let value = serde_json::to_value(&order).unwrap();
        assert_eq!(value["totalCents"], 4200);
        assert!(value.get("createdAt").is_some());
    }
}
