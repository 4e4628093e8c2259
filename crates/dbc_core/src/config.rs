use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::url::URL_PREFIX;

/// One named database endpoint, as hydrated by a configuration file.
///
/// The connectivity layer itself consumes only the URL this record renders
/// plus the credential strings; everything else is carried for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: IndexMap<String, String>,
}

impl DatabaseConfig {
    /// Render the connection URL for this endpoint.
    pub fn url(&self) -> String {
        let mut url = format!("{URL_PREFIX}{}://", self.db_type);

        if self.db_type == "sqlite" {
            url.push_str(self.database.as_deref().unwrap_or_default());
        } else {
            url.push_str(&self.host);
            if let Some(port) = self.port {
                url.push_str(&format!(":{port}"));
            }
            if let Some(database) = &self.database {
                url.push('/');
                url.push_str(database);
            }
        }

        if !self.options.is_empty() {
            let query: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }

        url
    }
}

/// The `databases:` document of a configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabasesFile {
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

impl DatabasesFile {
    pub fn from_yaml_str(text: &str) -> Result<Self, DbError> {
        serde_yaml::from_str(text)
            .map_err(|e| DbError::protocol(format!("invalid databases file: {e}")))
    }

    pub fn find(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|db| db.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::DatabasesFile;
    use crate::url::DbUrl;

    const SAMPLE: &str = r#"
databases:
  - name: main
    type: mysql
    host: db.host
    port: 3306
    database: appdb
    username: app
    password: secret
  - name: cache
    type: redis
    host: localhost
    port: 6379
    database: "0"
  - name: local
    type: sqlite
    database: /var/lib/app/state.db
    options:
      cache: shared
"#;

    #[test]
    fn yaml_round_trips_into_urls() {
        let file = DatabasesFile::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(file.databases.len(), 3);

        let main = file.find("main").unwrap();
        assert_eq!(main.url(), "cpp_dbc:mysql://db.host:3306/appdb");
        assert_eq!(main.username, "app");

        let local = file.find("local").unwrap();
        let url = local.url();
        assert_eq!(url, "cpp_dbc:sqlite:///var/lib/app/state.db?cache=shared");

        let parsed = DbUrl::parse(&url).unwrap();
        assert_eq!(parsed.database(), Some("/var/lib/app/state.db"));
        assert_eq!(parsed.options().get("cache").map(String::as_str), Some("shared"));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(DatabasesFile::from_yaml_str("databases: {").is_err());
    }
}
