//! Token and event row storage operations.
//!
//! Every write is insert-if-absent: a primary-key conflict skips the row
//! without touching stored columns.

use super::Storage;
use crate::intersection::AddressSource;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use cohort_core::{parse_address, to_hex, Address, EventRecord, EventSelector, TimeWindow, Token};
use sqlx::Row;
use std::collections::HashSet;

impl Storage {
    /// Insert tokens that are not stored yet, in one transaction.
    ///
    /// Returns how many tokens were new.
    pub async fn insert_tokens_if_absent(&self, tokens: &[Token]) -> Result<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("Failed to begin token tx")?;
        let mut inserted = 0;

        for token in tokens {
            let result = sqlx::query(
                r#"
                INSERT INTO tokens (id, name, symbol, decimals)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(to_hex(token.id))
            .bind(&token.name)
            .bind(&token.symbol)
            .bind(token.decimals as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to insert token")?;

            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit tokens")?;

        Ok(inserted)
    }

    /// Get a token by contract address.
    pub async fn get_token(&self, id: Address) -> Result<Option<Token>> {
        let row = sqlx::query("SELECT id, name, symbol, decimals FROM tokens WHERE id = ?")
            .bind(to_hex(id))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch token")?;

        row.map(|row| -> Result<Token> {
            let id: String = row.get("id");
            Ok(Token {
                id: parse_address(&id)?,
                name: row.get("name"),
                symbol: row.get("symbol"),
                decimals: row.get::<i64, _>("decimals") as u32,
            })
        })
        .transpose()
    }

    /// Insert `selector` rows that are not stored yet, in one transaction.
    ///
    /// Returns how many rows were new.
    pub async fn insert_events_if_absent(
        &self,
        selector: EventSelector,
        events: &[EventRecord],
    ) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            r#"
            INSERT INTO {} (
                id, hash, block_number, timestamp,
                from_address, to_address,
                amount0, token0_id, amount1, token1_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
            selector.table()
        );

        let mut tx = self.pool.begin().await.context("Failed to begin event tx")?;
        let mut inserted = 0;

        for event in events {
            let first = event
                .legs
                .first()
                .ok_or_else(|| anyhow!("Event {} carries no amount", event.id))?;
            let second = event.legs.get(1);

            let result = sqlx::query(&sql)
                .bind(&event.id)
                .bind(to_hex(event.hash))
                .bind(event.block_number as i64)
                .bind(event.timestamp)
                .bind(to_hex(event.from))
                .bind(event.to.map(to_hex))
                .bind(&first.amount)
                .bind(first.token.as_ref().map(|t| to_hex(t.id)))
                .bind(second.map(|leg| leg.amount.as_str()))
                .bind(second.and_then(|leg| leg.token.as_ref()).map(|t| to_hex(t.id)))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert {} event", selector))?;

            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit {} events", selector))?;

        Ok(inserted)
    }

    /// Count stored rows for a selector.
    pub async fn count_events(&self, selector: EventSelector) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", selector.table()))
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}

/// `?3, ?4, ...` for `len` members after the two window bounds.
fn member_placeholders(len: usize) -> String {
    (3..3 + len)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl AddressSource for Storage {
    async fn participants(
        &self,
        selector: EventSelector,
        window: TimeWindow,
        members: Option<&[Address]>,
    ) -> Result<HashSet<Address>> {
        let columns = if selector.is_two_sided() {
            "from_address, to_address"
        } else {
            "from_address, NULL AS to_address"
        };

        let mut sql = format!(
            "SELECT DISTINCT {columns} FROM {} WHERE timestamp BETWEEN ?1 AND ?2",
            selector.table()
        );

        // Numbered placeholders let both IN lists share one set of binds.
        if let Some(members) = members {
            let list = member_placeholders(members.len());
            if selector.is_two_sided() {
                sql.push_str(&format!(
                    " AND (from_address IN ({list}) OR to_address IN ({list}))"
                ));
            } else {
                sql.push_str(&format!(" AND from_address IN ({list})"));
            }
        }

        let mut query = sqlx::query(&sql).bind(window.start()).bind(window.end());
        for member in members.unwrap_or_default() {
            query = query.bind(to_hex(member));
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to query {} participants", selector))?;

        let mut found = HashSet::with_capacity(rows.len());
        for row in rows {
            let from: String = row.get("from_address");
            found.insert(parse_address(&from)?);

            let to: Option<String> = row.get("to_address");
            if let Some(to) = to {
                found.insert(parse_address(&to)?);
            }
        }

        Ok(found)
    }
}
