//! Postgres-backed contact store.
//!
//! Contact state outlives worker restarts and is shared by every worker
//! replica, so an unsubscribe applied by one worker holds for all of them.
//! The schema lives in `migrations/` and is applied on connect.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

use super::{national_number, ContactStore, ContactUpdate, RecipientFilter};
use crate::address::normalize_email;
use crate::error::{StoreError, StoreResult};
use crate::types::{ContactState, Recipient};

const RECIPIENT_COLUMNS: &str = "id, name, email, phone, fields, campaign_id, \
     contact_attempts, last_contact_date, unsubscribed";

const UPSERT_RECIPIENT: &str = r#"
INSERT INTO outreach_recipients
    (id, name, email, phone, fields, campaign_id, contact_attempts, last_contact_date, unsubscribed)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (id) DO UPDATE SET
    name = EXCLUDED.name,
    email = EXCLUDED.email,
    phone = EXCLUDED.phone,
    fields = EXCLUDED.fields,
    unsubscribed = outreach_recipients.unsubscribed OR EXCLUDED.unsubscribed,
    updated_at = now()
RETURNING (xmax = 0) AS inserted
"#;

const RECORD_CONTACT: &str = r#"
UPDATE outreach_recipients SET
    contact_attempts = contact_attempts + 1,
    last_contact_date = $2,
    campaign_id = COALESCE($3, campaign_id),
    updated_at = now()
WHERE id = $1
RETURNING campaign_id, contact_attempts, last_contact_date, unsubscribed
"#;

// Phones match on their trailing national number, as in the in-memory store.
const MARK_UNSUBSCRIBED: &str = r#"
UPDATE outreach_recipients SET unsubscribed = TRUE, updated_at = now()
WHERE lower(btrim(email)) = $1
   OR ($2::text IS NOT NULL
       AND length(regexp_replace(coalesce(phone, ''), '[^0-9]', '', 'g')) >= 10
       AND right(regexp_replace(coalesce(phone, ''), '[^0-9]', '', 'g'), 10) = $2)
"#;

/// [`ContactStore`] over a shared Postgres pool.
#[derive(Clone)]
pub struct PgContactStore {
    pool: PgPool,
}

impl PgContactStore {
    /// Open a pool and bring the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(unavailable)?;

        info!(max_connections = max_connections, "contact_store_connected");

        let store = Self::with_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Use an existing pool. The schema is assumed to be migrated.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;

        info!("contact_store_migrated");
        Ok(())
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn attempts_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn attempts_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn contact_from_row(row: &PgRow) -> Result<ContactState, sqlx::Error> {
    Ok(ContactState {
        campaign_id: row.try_get("campaign_id")?,
        contact_attempts: attempts_from_db(row.try_get("contact_attempts")?),
        last_contact_date: row.try_get("last_contact_date")?,
        unsubscribed: row.try_get("unsubscribed")?,
    })
}

fn recipient_from_row(row: &PgRow) -> Result<Recipient, sqlx::Error> {
    let Json(fields): Json<BTreeMap<String, String>> = row.try_get("fields")?;

    Ok(Recipient {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        fields,
        contact: contact_from_row(row)?,
    })
}

#[async_trait]
impl ContactStore for PgContactStore {
    async fn fetch_recipient(&self, id: &str) -> StoreResult<Option<Recipient>> {
        let sql = format!(
            "SELECT {} FROM outreach_recipients WHERE id = $1",
            RECIPIENT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.as_ref()
            .map(recipient_from_row)
            .transpose()
            .map_err(unavailable)
    }

    async fn fetch_recipients(&self, filter: &RecipientFilter) -> StoreResult<Vec<Recipient>> {
        let sql = format!(
            "SELECT {} FROM outreach_recipients \
             WHERE ($1::text[] IS NULL OR id = ANY($1)) \
               AND ($2 OR NOT unsubscribed) \
               AND fields @> $3 \
             ORDER BY id",
            RECIPIENT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(filter.ids.as_deref())
            .bind(filter.include_unsubscribed)
            .bind(Json(&filter.fields))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let recipients = rows
            .iter()
            .map(recipient_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        // Preserve the caller's ordering when ids are given.
        match &filter.ids {
            Some(ids) => {
                let by_id: HashMap<&str, &Recipient> =
                    recipients.iter().map(|r| (r.id.as_str(), r)).collect();
                Ok(ids
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).map(|r| (*r).clone()))
                    .collect())
            }
            None => Ok(recipients),
        }
    }

    async fn upsert_recipients(&self, recipients: &[Recipient]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut inserted = 0;

        for r in recipients {
            let row = sqlx::query(UPSERT_RECIPIENT)
                .bind(&r.id)
                .bind(&r.name)
                .bind(r.email.as_deref())
                .bind(r.phone.as_deref())
                .bind(Json(&r.fields))
                .bind(r.contact.campaign_id.as_deref())
                .bind(attempts_to_db(r.contact.contact_attempts))
                .bind(r.contact.last_contact_date)
                .bind(r.contact.unsubscribed)
                .fetch_one(&mut *tx)
                .await
                .map_err(unavailable)?;

            if row.try_get::<bool, _>("inserted").map_err(unavailable)? {
                inserted += 1;
            }
        }

        tx.commit().await.map_err(unavailable)?;

        debug!(received = recipients.len(), inserted = inserted, "store_upsert_complete");
        Ok(inserted)
    }

    async fn record_contact(&self, id: &str, update: &ContactUpdate) -> StoreResult<ContactState> {
        let row = sqlx::query(RECORD_CONTACT)
            .bind(id)
            .bind(update.contacted_at)
            .bind(update.campaign_id.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        contact_from_row(&row).map_err(unavailable)
    }

    async fn mark_unsubscribed(&self, address: &str) -> StoreResult<bool> {
        let email = normalize_email(address);
        let national = if address.contains('@') {
            None
        } else {
            let digits: String = address.chars().filter(|c| c.is_ascii_digit()).collect();
            national_number(&digits).map(str::to_string)
        };

        let result = sqlx::query(MARK_UNSUBSCRIBED)
            .bind(&email)
            .bind(national.as_deref())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        let matched = result.rows_affected() > 0;
        info!(
            matched_rows = result.rows_affected(),
            "store_recipients_unsubscribed"
        );
        Ok(matched)
    }
}
