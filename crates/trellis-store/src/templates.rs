use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use trellis_core::error::Result;
use trellis_core::types::{TemplateDefinition, TemplateId, WorkflowTemplate};

use crate::store::{db_err, json_col, to_json, ts, ts_col, SqliteStore};

const TEMPLATE_SELECT: &str = "SELECT t.id, v.version, t.active, v.published_at, v.definition
     FROM templates t
     JOIN template_versions v ON v.template_id = t.id";

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<WorkflowTemplate> {
    let id: String = row.get(0)?;
    let version: i64 = row.get(1)?;
    Ok(WorkflowTemplate {
        id: TemplateId(id),
        version: version as u32,
        active: row.get(2)?,
        published_at: ts_col(row, 3)?,
        definition: json_col(row, 4)?,
    })
}

impl SqliteStore {
    /// Publish a definition. An existing (tenant, name) gets version N+1
    /// under the same id; the active flag is left as it was.
    pub fn publish_template(
        &self,
        definition: &TemplateDefinition,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTemplate> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let existing: Option<(String, i64, bool)> = tx
            .query_row(
                "SELECT id, current_version, active FROM templates WHERE tenant = ?1 AND name = ?2",
                params![definition.tenant, definition.name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;

        let (id, version, active) = match existing {
            Some((id, current, active)) => {
                let next = current + 1;
                tx.execute(
                    "UPDATE templates SET current_version = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, next, ts(&now)],
                )
                .map_err(db_err)?;
                (TemplateId(id), next as u32, active)
            }
            None => {
                let id = TemplateId::new();
                tx.execute(
                    "INSERT INTO templates (id, tenant, name, current_version, active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, 1, ?4, ?4)",
                    params![id.0, definition.tenant, definition.name, ts(&now)],
                )
                .map_err(db_err)?;
                (id, 1, true)
            }
        };

        tx.execute(
            "INSERT INTO template_versions (template_id, version, definition, published_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.0, version as i64, to_json(definition)?, ts(&now)],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(template_id = %id, name = %definition.name, version, "Template published");
        Ok(WorkflowTemplate {
            id,
            version,
            active,
            published_at: now,
            definition: definition.clone(),
        })
    }

    /// Current version of a template.
    pub fn get_template(&self, id: &TemplateId) -> Result<Option<WorkflowTemplate>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{TEMPLATE_SELECT} WHERE t.id = ?1 AND v.version = t.current_version"),
            params![id.0],
            row_to_template,
        )
        .optional()
        .map_err(db_err)
    }

    /// A specific published version. The `active` flag reflects the
    /// template as a whole.
    pub fn get_template_version(
        &self,
        id: &TemplateId,
        version: u32,
    ) -> Result<Option<WorkflowTemplate>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{TEMPLATE_SELECT} WHERE t.id = ?1 AND v.version = ?2"),
            params![id.0, version as i64],
            row_to_template,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn find_template_by_name(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Option<WorkflowTemplate>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "{TEMPLATE_SELECT} WHERE t.tenant = ?1 AND t.name = ?2 AND v.version = t.current_version"
            ),
            params![tenant, name],
            row_to_template,
        )
        .optional()
        .map_err(db_err)
    }

    /// Current versions, optionally restricted to one tenant.
    pub fn list_templates(&self, tenant: Option<&str>) -> Result<Vec<WorkflowTemplate>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{TEMPLATE_SELECT}
                 WHERE v.version = t.current_version AND (?1 IS NULL OR t.tenant = ?1)
                 ORDER BY t.tenant, t.name"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant], row_to_template)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Current versions of the active templates of one tenant.
    pub fn active_templates(&self, tenant: &str) -> Result<Vec<WorkflowTemplate>> {
        Ok(self
            .list_templates(Some(tenant))?
            .into_iter()
            .filter(|t| t.active)
            .collect())
    }

    /// Toggle the active flag without creating a version. Returns false for
    /// an unknown template.
    pub fn set_template_active(&self, id: &TemplateId, active: bool) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE templates SET active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.0, active, ts(&Utc::now())],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }
}
