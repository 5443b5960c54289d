use anyhow::Result;
use async_trait::async_trait;
use chat_core::{Message, MessageStore};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

use crate::db::{get_connection, DbPool};
use crate::redis::RedisPool;
use crate::schema::messages;
use crate::stream;

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: String,
    match_id: String,
    sender_id: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.match_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

/// Message rows in Postgres. Every insert is also published to the
/// conversation's Redis stream so live subscribers see it.
pub struct PgMessageStore {
    db_pool: Arc<DbPool>,
    redis_pool: Option<RedisPool>,
}

impl PgMessageStore {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self {
            db_pool,
            redis_pool: None,
        }
    }

    pub fn with_publisher(mut self, redis_pool: RedisPool) -> Self {
        self.redis_pool = Some(redis_pool);
        self
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut conn = get_connection(&self.db_pool).await?;

        let rows: Vec<MessageRow> = messages::table
            .filter(messages::match_id.eq(conversation_id))
            .order(messages::created_at.asc())
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn insert(&self, conversation_id: &str, sender_id: &str, content: &str) -> Result<Message> {
        let mut conn = get_connection(&self.db_pool).await?;

        let row: MessageRow = diesel::insert_into(messages::table)
            .values((
                messages::id.eq(Uuid::new_v4().to_string()),
                messages::match_id.eq(conversation_id),
                messages::sender_id.eq(sender_id),
                messages::content.eq(content),
            ))
            .returning(MessageRow::as_returning())
            .get_result(&mut conn)
            .await?;
        let message = Message::from(row);

        if let Some(redis_pool) = &self.redis_pool {
            // the row is committed; subscribers that miss this catch up on reconciliation
            if let Err(e) = stream::publish_insert(redis_pool, &message).await {
                tracing::warn!(
                    "Stored message {} but failed to publish it: {}",
                    message.id,
                    e
                );
            }
        }

        Ok(message)
    }
}
