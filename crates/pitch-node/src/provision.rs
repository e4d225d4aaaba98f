//! Asset provisioning: fetch team bundle archives from ranked providers
//! and install them under the node's data directory.
//!
//! A bundle is valid once it carries the `start.sh` marker at its root.
//! Provisioning is best-effort per asset: each failure is logged and
//! collected, never aborting the run, so one broken provider cannot
//! block an update of every other bundle.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NodeError, NodeResult};
use crate::game::{BUNDLES_DIR, MARKER_FILE};

/// One place a bundle archive can be fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Provider {
    /// Direct HTTP(S) download.
    Url { url: String },
    /// Object lookup in the configured bundle store.
    Store { key: String },
}

/// A bundle to provision and its providers in preference order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSpec {
    pub name: String,
    pub providers: Vec<Provider>,
}

/// Backend for `Provider::Store` lookups.
pub trait BundleStore: Send + Sync {
    fn fetch(&self, key: &str) -> NodeResult<Vec<u8>>;
}

/// What an update run accomplished, reported back over the command
/// channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ProvisionSummary {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Downloads, extracts, and verifies bundle archives.
pub struct Provisioner {
    data_dir: PathBuf,
    http: reqwest::Client,
    store: Option<Arc<dyn BundleStore>>,
}

impl Provisioner {
    pub fn new(data_dir: &Path, store: Option<Arc<dyn BundleStore>>) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            http: reqwest::Client::new(),
            store,
        }
    }

    /// Provision the given assets, continuing past per-asset failures.
    ///
    /// With `overrides` set, only the named assets are touched. With
    /// `use_alt_source`, URL providers are skipped and only the bundle
    /// store is consulted.
    pub async fn provision(
        &self,
        assets: &[AssetSpec],
        overrides: Option<&[String]>,
        use_alt_source: bool,
    ) -> ProvisionSummary {
        let mut summary = ProvisionSummary::default();
        for asset in assets {
            if let Some(wanted) = overrides {
                if !wanted.contains(&asset.name) {
                    continue;
                }
            }
            match self.provision_one(asset, use_alt_source).await {
                Ok(()) => {
                    info!(bundle = %asset.name, "bundle provisioned");
                    summary.succeeded.push(asset.name.clone());
                }
                Err(e) => {
                    warn!(bundle = %asset.name, error = %e, "bundle provisioning failed");
                    summary.failed.push((asset.name.clone(), e.to_string()));
                }
            }
        }
        summary
    }

    /// Try each provider in order until one yields a valid bundle.
    async fn provision_one(&self, asset: &AssetSpec, use_alt_source: bool) -> NodeResult<()> {
        let mut last_err = NodeError::ProviderFetchFailed(format!(
            "no usable provider for bundle {}",
            asset.name
        ));
        for provider in &asset.providers {
            if use_alt_source && matches!(provider, Provider::Url { .. }) {
                continue;
            }
            match self.fetch(provider).await {
                Ok(bytes) => match self.install(&asset.name, &bytes) {
                    Ok(()) => return Ok(()),
                    Err(e) => last_err = e,
                },
                Err(e) => {
                    warn!(bundle = %asset.name, error = %e, "provider failed, trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch(&self, provider: &Provider) -> NodeResult<Vec<u8>> {
        match provider {
            Provider::Url { url } => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| NodeError::ProviderFetchFailed(e.to_string()))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| NodeError::ProviderFetchFailed(e.to_string()))?;
                Ok(bytes.to_vec())
            }
            Provider::Store { key } => {
                let store = self.store.as_ref().ok_or_else(|| {
                    NodeError::ProviderFetchFailed("no bundle store configured".into())
                })?;
                store.fetch(key)
            }
        }
    }

    /// Extract the archive into place and verify the marker; a failed
    /// install leaves no partial bundle behind.
    fn install(&self, name: &str, bytes: &[u8]) -> NodeResult<()> {
        let dir = self.data_dir.join(BUNDLES_DIR).join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let result = extract_and_verify(bytes, &dir);
        if result.is_err() {
            let _ = fs::remove_dir_all(&dir);
        }
        result
    }
}

fn extract_and_verify(bytes: &[u8], dir: &Path) -> NodeResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| NodeError::Archive(e.to_string()))?;
    archive
        .extract(dir)
        .map_err(|e| NodeError::Archive(e.to_string()))?;

    if !dir.join(MARKER_FILE).exists() {
        return Err(NodeError::Archive(format!(
            "archive carries no {MARKER_FILE} marker"
        )));
    }
    normalize_permissions(dir)
}

/// Bundles arrive from arbitrary packagers; make everything executable
/// so start scripts and binaries actually run.
#[cfg(unix)]
fn normalize_permissions(dir: &Path) -> NodeResult<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn normalize_permissions(_dir: &Path) -> NodeResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    struct MapStore(HashMap<String, Vec<u8>>);

    impl BundleStore for MapStore {
        fn fetch(&self, key: &str) -> NodeResult<Vec<u8>> {
            self.0
                .get(key)
                .cloned()
                .ok_or_else(|| NodeError::ProviderFetchFailed(format!("no object {key}")))
        }
    }

    fn bundle_zip(with_marker: bool) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        if with_marker {
            writer.start_file(MARKER_FILE, options).unwrap();
            writer.write_all(b"#!/bin/sh\nexec ./agent\n").unwrap();
        }
        writer.start_file("agent.conf", options).unwrap();
        writer.write_all(b"formation=433\n").unwrap();
        writer.finish().unwrap();
        buf.into_inner()
    }

    fn store_with(key: &str, bytes: Vec<u8>) -> Arc<dyn BundleStore> {
        Arc::new(MapStore(HashMap::from([(key.to_string(), bytes)])))
    }

    fn store_asset(name: &str, key: &str) -> AssetSpec {
        AssetSpec {
            name: name.to_string(),
            providers: vec![Provider::Store { key: key.to_string() }],
        }
    }

    #[tokio::test]
    async fn store_provider_installs_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("cyrus.zip", bundle_zip(true));
        let provisioner = Provisioner::new(dir.path(), Some(store));

        let summary = provisioner
            .provision(&[store_asset("cyrus", "cyrus.zip")], None, false)
            .await;
        assert!(summary.is_ok());
        assert_eq!(summary.succeeded, vec!["cyrus"]);
        assert!(dir.path().join(BUNDLES_DIR).join("cyrus").join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn missing_marker_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("bad.zip", bundle_zip(false));
        let provisioner = Provisioner::new(dir.path(), Some(store));

        let summary = provisioner
            .provision(&[store_asset("bad", "bad.zip")], None, false)
            .await;
        assert_eq!(summary.failed.len(), 1);
        assert!(!dir.path().join(BUNDLES_DIR).join("bad").exists());
    }

    #[tokio::test]
    async fn failure_does_not_abort_remaining_assets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("good.zip", bundle_zip(true));
        let provisioner = Provisioner::new(dir.path(), Some(store));

        let summary = provisioner
            .provision(
                &[store_asset("missing", "absent.zip"), store_asset("good", "good.zip")],
                None,
                false,
            )
            .await;
        assert_eq!(summary.succeeded, vec!["good"]);
        assert_eq!(summary.failed[0].0, "missing");
    }

    #[tokio::test]
    async fn overrides_limit_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("a.zip", bundle_zip(true));
        let provisioner = Provisioner::new(dir.path(), Some(store));

        let assets = [store_asset("a", "a.zip"), store_asset("untouched", "nope.zip")];
        let summary = provisioner
            .provision(&assets, Some(&["a".to_string()]), false)
            .await;
        assert!(summary.is_ok());
        assert_eq!(summary.succeeded, vec!["a"]);
    }

    #[tokio::test]
    async fn alt_source_skips_url_providers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("cyrus.zip", bundle_zip(true));
        let provisioner = Provisioner::new(dir.path(), Some(store));

        // URL listed first; alt-source mode must never touch it.
        let asset = AssetSpec {
            name: "cyrus".to_string(),
            providers: vec![
                Provider::Url { url: "http://127.0.0.1:1/unreachable.zip".to_string() },
                Provider::Store { key: "cyrus.zip".to_string() },
            ],
        };
        let summary = provisioner.provision(&[asset], None, true).await;
        assert!(summary.is_ok());
    }

    #[tokio::test]
    async fn fallback_to_next_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with("cyrus.zip", bundle_zip(true));
        let provisioner = Provisioner::new(dir.path(), Some(store));

        let asset = AssetSpec {
            name: "cyrus".to_string(),
            providers: vec![
                Provider::Store { key: "wrong-key.zip".to_string() },
                Provider::Store { key: "cyrus.zip".to_string() },
            ],
        };
        let summary = provisioner.provision(&[asset], None, false).await;
        assert!(summary.is_ok());
    }
}
