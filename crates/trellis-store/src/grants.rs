use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use trellis_core::error::Result;
use trellis_core::types::{AgentPermission, TemplateId};

use crate::store::{db_err, json_col, opt_ts, opt_ts_col, to_json, ts, ts_col, SqliteStore};

const PERMISSION_COLUMNS: &str =
    "id, agent_id, template_id, can_initiate, can_approve, conditions, created_at, expires_at";

fn row_to_permission(row: &Row<'_>) -> rusqlite::Result<AgentPermission> {
    let template_id: String = row.get(2)?;
    Ok(AgentPermission {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        template_id: TemplateId(template_id),
        can_initiate: row.get(3)?,
        can_approve: row.get(4)?,
        conditions: json_col(row, 5)?,
        created_at: ts_col(row, 6)?,
        expires_at: opt_ts_col(row, 7)?,
    })
}

impl SqliteStore {
    // ── Agent permissions ──────────────────────────────────────

    pub fn insert_permission(&self, grant: &AgentPermission) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO agent_permissions ({PERMISSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                grant.id,
                grant.agent_id,
                grant.template_id.0,
                grant.can_initiate,
                grant.can_approve,
                to_json(&grant.conditions)?,
                ts(&grant.created_at),
                opt_ts(&grant.expires_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// All grants (expired included) for one agent on one template.
    pub fn permissions_for(
        &self,
        agent_id: &str,
        template_id: &TemplateId,
    ) -> Result<Vec<AgentPermission>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PERMISSION_COLUMNS} FROM agent_permissions
                 WHERE agent_id = ?1 AND template_id = ?2
                 ORDER BY created_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent_id, template_id.0], row_to_permission)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Unexpired grants on a template, optionally only those allowing approval.
    pub fn template_permissions(
        &self,
        template_id: &TemplateId,
        approve_only: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentPermission>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PERMISSION_COLUMNS} FROM agent_permissions
                 WHERE template_id = ?1
                   AND (?2 = 0 OR can_approve = 1)
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY agent_id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![template_id.0, approve_only, ts(&now)], row_to_permission)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn revoke_permission(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM agent_permissions WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    // ── Template secrets ───────────────────────────────────────

    /// Insert or replace an encrypted secret.
    pub fn put_secret(
        &self,
        template_id: &TemplateId,
        name: &str,
        nonce: &[u8],
        ciphertext: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO template_secrets (template_id, name, nonce, ciphertext, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(template_id, name) DO UPDATE SET
                 nonce = excluded.nonce,
                 ciphertext = excluded.ciphertext,
                 updated_at = excluded.updated_at",
            params![template_id.0, name, nonce, ciphertext, ts(&now)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// `(nonce, ciphertext)` of a secret.
    pub fn get_secret(
        &self,
        template_id: &TemplateId,
        name: &str,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT nonce, ciphertext FROM template_secrets WHERE template_id = ?1 AND name = ?2",
            params![template_id.0, name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_secret_names(&self, template_id: &TemplateId) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT name FROM template_secrets WHERE template_id = ?1 ORDER BY name")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![template_id.0], |row| row.get(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn delete_secret(&self, template_id: &TemplateId, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM template_secrets WHERE template_id = ?1 AND name = ?2",
                params![template_id.0, name],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }
}
