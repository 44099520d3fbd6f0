//! Convenience macros for working with the outbox.

/// Save an event to the outbox within a transaction.
///
/// This macro simplifies the common pattern of building an [`OutboxEvent`](crate::OutboxEvent)
/// stamped with the current time and inserting it next to the business mutation.
///
/// # Usage
///
/// ```rust,no_run
/// use transactional_outbox::{publish_event, OutboxError, SqlxOutboxStore};
/// use sqlx::PgPool;
/// use uuid::Uuid;
/// use serde_json::json;
///
/// # async fn example(pool: PgPool, outbox: SqlxOutboxStore) -> Result<(), OutboxError> {
/// let mut tx = pool.begin().await?;
/// let user_id = Uuid::new_v4();
///
/// // Insert business logic
/// sqlx::query("UPDATE users SET email_verified = TRUE WHERE id = $1")
///     .bind(user_id)
///     .execute(&mut *tx)
///     .await?;
///
/// // Save event (same transaction)
/// publish_event!(
///     &mut tx,
///     &outbox,
///     "User",
///     user_id,
///     "EmailVerified.v1",
///     json!({
///         "user_id": user_id,
///         "email": "alice@example.com",
///         "verified_at": chrono::Utc::now()
///     })
/// )?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
///
/// # Arguments
///
/// * `$tx` - Mutable reference to database transaction
/// * `$store` - Reference to a `SqlxOutboxStore`
/// * `$aggregate_type` - Type of aggregate (e.g., "User")
/// * `$aggregate_id` - Anything `Display`, used as the partition key
/// * `$event_type` - Versioned event tag (e.g., "EmailVerified.v1")
/// * `$payload` - JSON-serializable payload
#[macro_export]
macro_rules! publish_event {
    ($tx:expr, $store:expr, $aggregate_type:expr, $aggregate_id:expr, $event_type:expr, $payload:expr) => {
        $crate::publish_event_at!(
            $tx,
            $store,
            $aggregate_type,
            $aggregate_id,
            $event_type,
            $payload,
            chrono::Utc::now()
        )
    };
}

/// Save an event with an explicit business timestamp.
///
/// Similar to `publish_event!` but `occurred_at` is supplied by the caller, for
/// facts whose business time differs from the time of the write.
///
/// # Arguments
///
/// * `$occurred_at` - `DateTime<Utc>` of the business fact
#[macro_export]
macro_rules! publish_event_at {
    (
        $tx:expr,
        $store:expr,
        $aggregate_type:expr,
        $aggregate_id:expr,
        $event_type:expr,
        $payload:expr,
        $occurred_at:expr
    ) => {
        async {
            let event = $crate::OutboxEvent::new(
                $aggregate_type,
                $aggregate_id.to_string(),
                $event_type,
                $payload,
                $occurred_at,
            )?;
            $store.save($tx, &event).await?;
            Ok::<_, $crate::OutboxError>(event)
        }
        .await
    };
}
