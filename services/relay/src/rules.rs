//! Rule and plan persistence.
//!
//! Rules and plans are written only by the command executor; the ingest
//! pipeline reads enabled rules to annotate outbound payloads with the ids
//! of rules whose conditions match. Rule *actions* are opaque here -- acting
//! on a match is the orchestrator's job.

use crate::storage::{StateStore, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub rule_type: String,
    pub name: String,
    pub enabled: bool,
    pub conditions: Vec<serde_json::Value>,
    pub action: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub thread_id: String,
    pub version: i64,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RuleStore {
    store: StateStore,
}

impl RuleStore {
    pub fn new(store: StateStore) -> Self {
        RuleStore { store }
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// Create or replace a rule. A missing id means create with a fresh
    /// UUID; the created_at of an existing row is preserved.
    pub async fn upsert_rule(
        &self,
        id: Option<String>,
        rule_type: &str,
        name: &str,
        enabled: bool,
        conditions: &[serde_json::Value],
        action: &serde_json::Value,
    ) -> Result<String, StorageError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conditions_blob = self
            .store
            .encrypt(&serde_json::Value::Array(conditions.to_vec()).to_string());
        let action_blob = self.store.encrypt(&action.to_string());
        let now = Utc::now().to_rfc3339();
        let id_owned = id.clone();
        let rule_type = rule_type.to_owned();
        let name = name.to_owned();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rules
                         (id, rule_type, name, enabled, conditions, action, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                         rule_type = excluded.rule_type,
                         name = excluded.name,
                         enabled = excluded.enabled,
                         conditions = excluded.conditions,
                         action = excluded.action,
                         updated_at = excluded.updated_at",
                    params![
                        id_owned,
                        rule_type,
                        name,
                        enabled,
                        conditions_blob,
                        action_blob,
                        now
                    ],
                )
            })
            .await?;
        Ok(id)
    }

    pub async fn get_rule(&self, id: &str) -> Result<Option<Rule>, StorageError> {
        let id = id.to_owned();
        let row = self
            .store
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, rule_type, name, enabled, conditions, action,
                            created_at, updated_at
                     FROM rules WHERE id = ?1",
                    params![id],
                    map_rule_row,
                )
                .optional()
            })
            .await?;
        row.map(|r| self.decode_rule(r)).transpose()
    }

    pub async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StorageError> {
        let rows = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, rule_type, name, enabled, conditions, action,
                            created_at, updated_at
                     FROM rules WHERE enabled = 1 ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map([], map_rule_row)?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await?;
        rows.into_iter().map(|r| self.decode_rule(r)).collect()
    }

    /// Ids of enabled rules whose conditions all match the inbound message.
    ///
    /// Recognized condition shapes: `{"contains": "..."}` (case-insensitive
    /// text substring) and `{"sender": "..."}` (exact sender id). A condition
    /// of any other shape never matches, so unknown rule kinds stay inert.
    pub async fn matching_rule_ids(
        &self,
        text: &str,
        sender_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let text_lower = text.to_lowercase();
        let matched = self
            .list_enabled_rules()
            .await?
            .into_iter()
            .filter(|rule| {
                !rule.conditions.is_empty()
                    && rule
                        .conditions
                        .iter()
                        .all(|c| condition_matches(c, &text_lower, sender_id))
            })
            .map(|rule| rule.id)
            .collect();
        Ok(matched)
    }

    fn decode_rule(&self, r: RuleRow) -> Result<Rule, StorageError> {
        let conditions_json = self.store.decrypt(&r.conditions_blob)?;
        let conditions = match serde_json::from_str(&conditions_json) {
            Ok(serde_json::Value::Array(items)) => items,
            _ => {
                return Err(StorageError::Corrupt(
                    "rule conditions are not a JSON array".to_owned(),
                ));
            }
        };
        let action_json = self.store.decrypt(&r.action_blob)?;
        let action = serde_json::from_str(&action_json)
            .map_err(|e| StorageError::Corrupt(format!("rule action: {e}")))?;
        Ok(Rule {
            id: r.id,
            rule_type: r.rule_type,
            name: r.name,
            enabled: r.enabled,
            conditions,
            action,
            created_at: parse_instant(&r.created_at)?,
            updated_at: parse_instant(&r.updated_at)?,
        })
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Create or replace the thread's plan. The version is monotonic: 1 on
    /// create, previous + 1 on every replace.
    pub async fn upsert_plan(
        &self,
        thread_id: &str,
        data: &serde_json::Value,
    ) -> Result<i64, StorageError> {
        let data_blob = self.store.encrypt(&data.to_string());
        let now = Utc::now().to_rfc3339();
        let thread_id = thread_id.to_owned();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO plans (thread_id, version, data, updated_at)
                     VALUES (?1, 1, ?2, ?3)
                     ON CONFLICT(thread_id) DO UPDATE SET
                         version = plans.version + 1,
                         data = excluded.data,
                         updated_at = excluded.updated_at",
                    params![thread_id, data_blob, now],
                )?;
                conn.query_row(
                    "SELECT version FROM plans WHERE thread_id = ?1",
                    params![thread_id],
                    |row| row.get(0),
                )
            })
            .await
    }

    pub async fn get_plan(&self, thread_id: &str) -> Result<Option<Plan>, StorageError> {
        let thread_id_owned = thread_id.to_owned();
        let row: Option<(String, i64, String, String)> = self
            .store
            .call(move |conn| {
                conn.query_row(
                    "SELECT thread_id, version, data, updated_at
                     FROM plans WHERE thread_id = ?1",
                    params![thread_id_owned],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
            })
            .await?;
        row.map(|(thread_id, version, data_blob, updated_at)| {
            let data_json = self.store.decrypt(&data_blob)?;
            let data = serde_json::from_str(&data_json)
                .map_err(|e| StorageError::Corrupt(format!("plan data: {e}")))?;
            Ok(Plan {
                thread_id,
                version,
                data,
                updated_at: parse_instant(&updated_at)?,
            })
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

struct RuleRow {
    id: String,
    rule_type: String,
    name: String,
    enabled: bool,
    conditions_blob: String,
    action_blob: String,
    created_at: String,
    updated_at: String,
}

fn map_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get(0)?,
        rule_type: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get(3)?,
        conditions_blob: row.get(4)?,
        action_blob: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn condition_matches(condition: &serde_json::Value, text_lower: &str, sender_id: &str) -> bool {
    let Some(obj) = condition.as_object() else {
        return false;
    };
    if let Some(needle) = obj.get("contains").and_then(|v| v.as_str()) {
        return text_lower.contains(&needle.to_lowercase());
    }
    if let Some(sender) = obj.get("sender").and_then(|v| v.as_str()) {
        return sender == sender_id;
    }
    false
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StateKey;
    use crate::storage::APP_SCHEMA;
    use serde_json::json;

    fn make_store() -> RuleStore {
        let store = StateStore::open_in_memory(&StateKey([3u8; 32]), APP_SCHEMA).unwrap();
        RuleStore::new(store)
    }

    #[tokio::test]
    async fn upsert_rule_creates_and_replaces() {
        let rules = make_store();
        let id = rules
            .upsert_rule(
                None,
                "keyword",
                "mute spam",
                true,
                &[json!({"contains": "prize"})],
                &json!({"kind": "suppress"}),
            )
            .await
            .unwrap();

        rules
            .upsert_rule(
                Some(id.clone()),
                "keyword",
                "mute spam v2",
                false,
                &[json!({"contains": "prize"})],
                &json!({"kind": "suppress"}),
            )
            .await
            .unwrap();

        let rule = rules.get_rule(&id).await.unwrap().unwrap();
        assert_eq!(rule.name, "mute spam v2");
        assert!(!rule.enabled);
    }

    #[tokio::test]
    async fn disabled_rules_never_match() {
        let rules = make_store();
        rules
            .upsert_rule(
                None,
                "keyword",
                "off",
                false,
                &[json!({"contains": "hello"})],
                &json!({}),
            )
            .await
            .unwrap();
        let matched = rules.matching_rule_ids("hello there", "+15551234567").await.unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn all_conditions_must_match() {
        let rules = make_store();
        let id = rules
            .upsert_rule(
                None,
                "keyword",
                "targeted",
                true,
                &[
                    json!({"contains": "Lunch"}),
                    json!({"sender": "+15551234567"}),
                ],
                &json!({}),
            )
            .await
            .unwrap();

        let hit = rules
            .matching_rule_ids("lunch at noon?", "+15551234567")
            .await
            .unwrap();
        assert_eq!(hit, vec![id]);

        let wrong_sender = rules
            .matching_rule_ids("lunch at noon?", "+15559999999")
            .await
            .unwrap();
        assert!(wrong_sender.is_empty());
    }

    #[tokio::test]
    async fn unknown_condition_shapes_stay_inert() {
        let rules = make_store();
        rules
            .upsert_rule(
                None,
                "exotic",
                "future",
                true,
                &[json!({"regex": ".*"})],
                &json!({}),
            )
            .await
            .unwrap();
        let matched = rules.matching_rule_ids("anything", "s").await.unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn plan_version_is_monotonic() {
        let rules = make_store();
        let v1 = rules.upsert_plan("T1", &json!({"step": 1})).await.unwrap();
        let v2 = rules.upsert_plan("T1", &json!({"step": 2})).await.unwrap();
        let v3 = rules.upsert_plan("T1", &json!({"step": 3})).await.unwrap();
        assert_eq!((v1, v2, v3), (1, 2, 3));

        let plan = rules.get_plan("T1").await.unwrap().unwrap();
        assert_eq!(plan.version, 3);
        assert_eq!(plan.data["step"], 3);
    }
}
