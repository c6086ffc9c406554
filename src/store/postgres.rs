use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::conversation::direct_key;
use crate::models::{
    Conversation, ConversationKind, ConversationPage, ConversationSummary, Message, MessagePage,
};
use crate::store::{AppendOutcome, ConversationStore};

/// Store backed by PostgreSQL. Sequence assignment rides on the conversation
/// row lock (`UPDATE … RETURNING`); direct-pair and nonce idempotency ride on
/// unique constraints with fetch-on-conflict fallbacks.
#[derive(Clone)]
pub struct PgConversationStore {
    db: Pool<Postgres>,
}

const CONVERSATION_COLUMNS: &str = r#"
    c.id, c.kind, c.title, c.created_by, c.last_message_at, c.created_at,
    ARRAY(
        SELECT cm.user_id FROM conversation_members cm
        WHERE cm.conversation_id = c.id
        ORDER BY cm.joined_at, cm.user_id
    ) AS participant_ids
"#;

const MESSAGE_COLUMNS: &str = r#"
    m.id, m.conversation_id, m.sender_id, m.sequence, m.content, m.client_nonce,
    m.reply_to, m.delivered_to, m.deleted_for, m.created_at,
    ARRAY(
        SELECT cm.user_id FROM conversation_members cm
        WHERE cm.conversation_id = m.conversation_id
          AND cm.last_read_sequence >= m.sequence
    ) AS read_by
"#;

fn conversation_from_row(row: &PgRow) -> Conversation {
    let kind: String = row.get("kind");
    Conversation {
        id: row.get("id"),
        kind: ConversationKind::parse(&kind),
        title: row.get("title"),
        participant_ids: row.get("participant_ids"),
        created_by: row.get("created_by"),
        last_message_at: row.get("last_message_at"),
        created_at: row.get("created_at"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        sequence: row.get("sequence"),
        content: row.get("content"),
        client_nonce: row.get("client_nonce"),
        reply_to: row.get("reply_to"),
        delivered_to: row.get("delivered_to"),
        read_by: row.get("read_by"),
        deleted_for: row.get("deleted_for"),
        created_at: row.get("created_at"),
    }
}

impl PgConversationStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    async fn fetch_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn fetch_by_direct_key(&self, key: &str) -> AppResult<Option<Conversation>> {
        let sql =
            format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.direct_key = $1");
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.db).await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn fetch_message_by_nonce(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        client_nonce: &str,
    ) -> AppResult<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m \
             WHERE m.conversation_id = $1 AND m.sender_id = $2 AND m.client_nonce = $3"
        );
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(sender_id)
            .bind(client_nonce)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.as_ref().map(message_from_row))
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn get_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        let key = direct_key(a, b);
        if let Some(existing) = self.fetch_by_direct_key(&key).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO conversations (id, kind, direct_key, created_by) \
             VALUES ($1, 'direct', $2, $3) ON CONFLICT (direct_key) DO NOTHING",
        )
        .bind(id)
        .bind(&key)
        .bind(a)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Lost the race; the winner's row is the conversation.
            tx.rollback().await?;
            return self
                .fetch_by_direct_key(&key)
                .await?
                .ok_or(AppError::NotFound);
        }

        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id) \
             VALUES ($1, $2), ($1, $3) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(a)
        .bind(b)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.fetch_conversation(id).await?.ok_or(AppError::NotFound)
    }

    async fn create_group(
        &self,
        creator_id: Uuid,
        title: Option<String>,
        participant_ids: Vec<Uuid>,
    ) -> AppResult<Conversation> {
        let id = Uuid::new_v4();
        let mut members = vec![creator_id];
        for p in participant_ids {
            if !members.contains(&p) {
                members.push(p);
            }
        }

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, kind, title, created_by) VALUES ($1, 'group', $2, $3)",
        )
        .bind(id)
        .bind(&title)
        .bind(creator_id)
        .execute(&mut *tx)
        .await?;

        for member in &members {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(member)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.fetch_conversation(id).await?.ok_or(AppError::NotFound)
    }

    async fn get(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        self.fetch_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT user_id FROM conversation_members WHERE conversation_id = $1 \
             ORDER BY joined_at, user_id",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        if rows.is_empty() {
            return Err(AppError::NotFound);
        }
        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let rec = sqlx::query(
            "SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2 LIMIT 1",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(rec.is_some())
    }

    async fn contacts(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT other.user_id FROM conversation_members me \
             JOIN conversation_members other ON other.conversation_id = me.conversation_id \
             WHERE me.user_id = $1 AND other.user_id <> $1",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<ConversationPage> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}, me.unread_count, \
                    COALESCE(c.last_message_at, c.created_at) AS effective_at \
             FROM conversations c \
             JOIN conversation_members me ON me.conversation_id = c.id AND me.user_id = $1 \
             WHERE $2::timestamptz IS NULL OR COALESCE(c.last_message_at, c.created_at) < $2 \
             ORDER BY effective_at DESC \
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(&self.db)
            .await?;

        let has_more = rows.len() as i64 > limit;
        let mut conversations = Vec::with_capacity(rows.len().min(limit as usize));
        let mut next_cursor = None;
        for row in rows.iter().take(limit as usize) {
            let effective_at: DateTime<Utc> = row.get("effective_at");
            next_cursor = Some(effective_at);
            conversations.push(ConversationSummary {
                conversation: conversation_from_row(row),
                unread_count: row.get("unread_count"),
            });
        }

        Ok(ConversationPage {
            conversations,
            next_cursor: if has_more { next_cursor } else { None },
        })
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_nonce: &str,
        reply_to: Option<Uuid>,
    ) -> AppResult<AppendOutcome> {
        // Retry fast path: the nonce already landed, return what was stored.
        if let Some(existing) = self
            .fetch_message_by_nonce(conversation_id, sender_id, client_nonce)
            .await?
        {
            return Ok(AppendOutcome {
                message: existing,
                created: false,
            });
        }

        let mut tx = self.db.begin().await?;

        if let Some(reply) = reply_to {
            let found =
                sqlx::query("SELECT 1 FROM messages WHERE id = $1 AND conversation_id = $2")
                    .bind(reply)
                    .bind(conversation_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if found.is_none() {
                return Err(AppError::Validation(
                    "reply_to must reference a message in the same conversation".into(),
                ));
            }
        }

        // The row lock taken here serializes sequence assignment for the
        // conversation; concurrent senders in other conversations are not
        // affected.
        let sequence: i64 = sqlx::query_scalar(
            "UPDATE conversations \
             SET last_sequence = last_sequence + 1, last_message_at = NOW() \
             WHERE id = $1 RETURNING last_sequence",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, sequence, content, client_nonce, reply_to) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT ON CONSTRAINT messages_sender_nonce_key DO NOTHING",
        )
        .bind(id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(sequence)
        .bind(content)
        .bind(client_nonce)
        .bind(reply_to)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Concurrent retry with the same nonce won; undo the sequence
            // bump and hand back the winner.
            tx.rollback().await?;
            let existing = self
                .fetch_message_by_nonce(conversation_id, sender_id, client_nonce)
                .await?
                .ok_or(AppError::NotFound)?;
            return Ok(AppendOutcome {
                message: existing,
                created: false,
            });
        }
        tx.commit().await?;

        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_one(&self.db).await?;
        Ok(AppendOutcome {
            message: message_from_row(&row),
            created: true,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        before_sequence: Option<i64>,
        limit: i64,
    ) -> AppResult<MessagePage> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m \
             WHERE m.conversation_id = $1 \
               AND NOT (m.deleted_for @> ARRAY[$2]::uuid[]) \
               AND ($3::bigint IS NULL OR m.sequence < $3) \
             ORDER BY m.sequence DESC \
             LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(viewer_id)
            .bind(before_sequence)
            .bind(limit + 1)
            .fetch_all(&self.db)
            .await?;

        let has_more = rows.len() as i64 > limit;
        let messages = rows
            .iter()
            .take(limit as usize)
            .map(message_from_row)
            .collect();
        Ok(MessagePage { messages, has_more })
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m \
             WHERE m.conversation_id = $1 \
               AND NOT (m.deleted_for @> ARRAY[$2]::uuid[]) \
               AND m.sequence > $3 \
             ORDER BY m.sequence ASC \
             LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(viewer_id)
            .bind(after_sequence)
            .bind(limit)
            .fetch_all(&self.db)
            .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE messages SET delivered_to = array_append(delivered_to, $3) \
             WHERE conversation_id = $1 AND id = $2 \
               AND NOT (delivered_to @> ARRAY[$3]::uuid[])",
        )
        .bind(conversation_id)
        .bind(message_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_sequence: i64,
    ) -> AppResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE conversation_members cm SET \
                 last_read_at = NOW(), \
                 last_read_sequence = GREATEST(cm.last_read_sequence, $3), \
                 unread_count = ( \
                     SELECT COUNT(*) FROM messages m \
                     WHERE m.conversation_id = $1 AND m.sender_id <> $2 \
                       AND m.sequence > GREATEST(cm.last_read_sequence, $3) \
                       AND NOT (m.deleted_for @> ARRAY[$2]::uuid[]) \
                 ) \
             WHERE cm.conversation_id = $1 AND cm.user_id = $2 \
             RETURNING unread_count",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(up_to_sequence)
        .fetch_optional(&self.db)
        .await?;
        count.ok_or(AppError::NotFound)
    }

    async fn increment_unread(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE conversation_members SET unread_count = unread_count + 1 \
             WHERE conversation_id = $1 AND user_id = $2 RETURNING unread_count",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        count.ok_or(AppError::NotFound)
    }

    async fn delete_for(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<i64> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(
            "SELECT sender_id, sequence, deleted_for FROM messages \
             WHERE conversation_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;

        let sender_id: Uuid = row.get("sender_id");
        let sequence: i64 = row.get("sequence");
        let deleted_for: Vec<Uuid> = row.get("deleted_for");

        if !deleted_for.contains(&user_id) {
            sqlx::query(
                "UPDATE messages SET deleted_for = array_append(deleted_for, $3) \
                 WHERE conversation_id = $1 AND id = $2",
            )
            .bind(conversation_id)
            .bind(message_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            // A still-unread message stops counting once deleted for this user.
            if sender_id != user_id {
                sqlx::query(
                    "UPDATE conversation_members \
                     SET unread_count = GREATEST(unread_count - 1, 0) \
                     WHERE conversation_id = $1 AND user_id = $2 AND last_read_sequence < $3",
                )
                .bind(conversation_id)
                .bind(user_id)
                .bind(sequence)
                .execute(&mut *tx)
                .await?;
            }
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT unread_count FROM conversation_members \
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;
        tx.commit().await?;
        Ok(count)
    }

    async fn latest_sequence(&self, conversation_id: Uuid) -> AppResult<i64> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(&self.db)
                .await?;
        seq.ok_or(AppError::NotFound)
    }
}
