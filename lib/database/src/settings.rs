use anyhow::Context;
use census_client::entities::settings::Settings;
use serde_json::Value;

use crate::Client;

const SYSTEM_CATEGORY: &str = "system";
const INSTALLATION_ID_KEY: &str = "installation_id";

impl Client {
  /// Load the full settings tree. Missing categories / keys fall back
  /// to defaults, so new settings deploy without migrations.
  pub async fn load_settings(&self) -> anyhow::Result<Settings> {
    let rows = sqlx::query_as::<_, (String, String, String)>(
      "SELECT category, key, value FROM settings WHERE category != ?",
    )
    .bind(SYSTEM_CATEGORY)
    .fetch_all(&self.pool)
    .await
    .context("Failed to load settings")?;

    let mut tree = serde_json::Map::new();
    for (category, key, value) in rows {
      let parsed: Value = serde_json::from_str(&value)
        .unwrap_or(Value::String(value));
      tree
        .entry(category)
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .map(|object| object.insert(key, parsed));
    }
    serde_json::from_value(Value::Object(tree))
      .context("Invalid settings in database")
  }

  /// Persist every key of every category. Individual keys are
  /// upserted so unknown rows (from newer versions) survive.
  pub async fn save_settings(
    &self,
    settings: &Settings,
  ) -> anyhow::Result<()> {
    let tree = serde_json::to_value(settings)
      .context("Failed to serialize settings")?;
    let Value::Object(categories) = tree else {
      return Err(anyhow::anyhow!(
        "Settings serialized to a non-object"
      ));
    };
    let mut tx = self
      .pool
      .begin()
      .await
      .context("Failed to begin settings transaction")?;
    for (category, keys) in categories {
      let Value::Object(keys) = keys else { continue };
      for (key, value) in keys {
        sqlx::query(
          "INSERT INTO settings (category, key, value) VALUES (?, ?, ?)
           ON CONFLICT (category, key) DO UPDATE SET value = excluded.value",
        )
        .bind(&category)
        .bind(&key)
        .bind(serde_json::to_string(&value)?)
        .execute(&mut *tx)
        .await
        .context("Failed to save setting")?;
      }
    }
    tx.commit()
      .await
      .context("Failed to commit settings transaction")?;
    Ok(())
  }

  /// Stable anonymous installation id, created on first access.
  pub async fn installation_id(
    &self,
  ) -> anyhow::Result<uuid::Uuid> {
    let existing: Option<String> = sqlx::query_scalar(
      "SELECT value FROM settings WHERE category = ? AND key = ?",
    )
    .bind(SYSTEM_CATEGORY)
    .bind(INSTALLATION_ID_KEY)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query installation id")?;

    if let Some(raw) = existing {
      let raw: String =
        serde_json::from_str(&raw).unwrap_or(raw);
      if let Ok(id) = raw.parse() {
        return Ok(id);
      }
    }

    let id = uuid::Uuid::new_v4();
    sqlx::query(
      "INSERT INTO settings (category, key, value) VALUES (?, ?, ?)
       ON CONFLICT (category, key) DO UPDATE SET value = excluded.value",
    )
    .bind(SYSTEM_CATEGORY)
    .bind(INSTALLATION_ID_KEY)
    .bind(serde_json::to_string(&id.to_string())?)
    .execute(&self.pool)
    .await
    .context("Failed to persist installation id")?;
    Ok(id)
  }
}

#[cfg(test)]
mod tests {
  use crate::test_client;

  #[tokio::test]
  async fn defaults_when_empty_and_round_trip() {
    let db = test_client().await;
    let settings = db.load_settings().await.unwrap();
    assert_eq!(settings.scanner.interval_seconds, 300);

    let mut updated = settings.clone();
    updated.scanner.interval_seconds = 60;
    updated.notifications.max_per_hour = 5;
    db.save_settings(&updated).await.unwrap();

    let loaded = db.load_settings().await.unwrap();
    assert_eq!(loaded, updated);
  }

  #[tokio::test]
  async fn installation_id_is_stable() {
    let db = test_client().await;
    let first = db.installation_id().await.unwrap();
    let second = db.installation_id().await.unwrap();
    assert_eq!(first, second);
  }
}
