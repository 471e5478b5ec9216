//! Publishes the subdomain → container-port mapping for running apps.
//!
//! An in-memory table behind `Arc<RwLock<HashMap>>`, mirrored to a JSON
//! file under the workroot after every change so an external reverse
//! proxy can watch it and pick up new routes without a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Binding {
    pub app_id: String,
    pub host_port: u16,
}

#[async_trait]
pub trait RouterBinding: Send + Sync + 'static {
    async fn bind(&self, subdomain: &str, app_id: &str, host_port: u16) -> Result<()>;
    async fn unbind(&self, subdomain: &str) -> Result<()>;
    async fn get(&self, subdomain: &str) -> Option<Binding>;
}

#[derive(Clone)]
pub struct FileRouterBinding {
    table: Arc<RwLock<HashMap<String, Binding>>>,
    routes_file: PathBuf,
}

impl FileRouterBinding {
    pub fn new(workroot: &std::path::Path) -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            routes_file: workroot.join("routes.json"),
        }
    }

    async fn flush(&self, table: &HashMap<String, Binding>) -> Result<()> {
        if let Some(parent) = self.routes_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(table)?;
        tokio::fs::write(&self.routes_file, json).await?;
        Ok(())
    }
}

#[async_trait]
impl RouterBinding for FileRouterBinding {
    async fn bind(&self, subdomain: &str, app_id: &str, host_port: u16) -> Result<()> {
        let mut table = self.table.write().await;
        table.insert(
            subdomain.to_string(),
            Binding {
                app_id: app_id.to_string(),
                host_port,
            },
        );
        self.flush(&table).await
    }

    async fn unbind(&self, subdomain: &str) -> Result<()> {
        let mut table = self.table.write().await;
        table.remove(subdomain);
        self.flush(&table).await
    }

    async fn get(&self, subdomain: &str) -> Option<Binding> {
        self.table.read().await.get(subdomain).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn bind_then_unbind_clears_entry_and_file() {
        let dir = tempdir().unwrap();
        let router = FileRouterBinding::new(dir.path());

        router.bind("hello", "app-1", 31000).await.unwrap();
        assert_eq!(
            router.get("hello").await,
            Some(Binding {
                app_id: "app-1".to_string(),
                host_port: 31000,
            })
        );

        let raw = tokio::fs::read_to_string(dir.path().join("routes.json"))
            .await
            .unwrap();
        assert!(raw.contains("app-1"));

        router.unbind("hello").await.unwrap();
        assert_eq!(router.get("hello").await, None);

        let raw = tokio::fs::read_to_string(dir.path().join("routes.json"))
            .await
            .unwrap();
        assert!(!raw.contains("app-1"));
    }

    #[tokio::test]
    async fn rebind_replaces_previous_port() {
        let dir = tempdir().unwrap();
        let router = FileRouterBinding::new(dir.path());

        router.bind("hello", "app-1", 31000).await.unwrap();
        router.bind("hello", "app-1", 31500).await.unwrap();

        assert_eq!(router.get("hello").await.unwrap().host_port, 31500);
    }
}
