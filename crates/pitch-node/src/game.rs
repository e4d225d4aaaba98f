//! One match's lifecycle: asset pre-check, server spawn, result
//! finalization.
//!
//! A match moves strictly forward through
//! `Scheduled → Starting → Running → Finalizing → {Completed, Failed}`
//! with a single terminal state and no retries. The supervising task
//! spawned per match awaits the child process outside any pool lock and
//! produces exactly one outcome.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use pitch_queue::JobDispatch;
use pitch_state::MatchId;

use crate::error::{NodeError, NodeResult};
use crate::ports::PortTriple;

/// Subdirectory of the data dir holding provisioned asset bundles.
pub const BUNDLES_DIR: &str = "bundles";

/// Subdirectory holding the simulation server binary.
pub const SERVER_DIR: &str = "server";

/// Subdirectory holding per-match log directories and result archives.
pub const MATCH_LOGS_DIR: &str = "match-logs";

/// Name of the simulation server binary.
pub const SERVER_BINARY: &str = "simserver";

/// File every valid bundle must contain.
pub const MARKER_FILE: &str = "start.sh";

/// Extension of the result artifact the server writes.
pub const ARTIFACT_EXT: &str = "rcg";

/// Artifact names carrying this marker denote an aborted match.
const INCOMPLETE_MARKER: &str = "incomplete";

/// Final score of a completed match, parsed from the artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchScores {
    pub left_score: i32,
    pub right_score: i32,
    pub left_penalty: Option<i32>,
    pub right_penalty: Option<i32>,
}

/// Everything needed to run one match: the dispatch payload, the assigned
/// ports, and the node's data directory.
#[derive(Debug, Clone)]
pub struct GameSpec {
    pub job_id: MatchId,
    pub dispatch: JobDispatch,
    pub ports: PortTriple,
    data_dir: PathBuf,
}

impl GameSpec {
    pub fn new(data_dir: &Path, dispatch: JobDispatch, ports: PortTriple) -> Self {
        Self {
            job_id: dispatch.job_id,
            dispatch,
            ports,
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Per-match log directory, keyed by job id.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(MATCH_LOGS_DIR).join(self.job_id.to_string())
    }

    /// Path of the archive the log directory is packaged into on success.
    pub fn archive_path(&self) -> PathBuf {
        self.data_dir
            .join(MATCH_LOGS_DIR)
            .join(format!("{}.zip", self.job_id))
    }

    /// Path of the simulation server binary.
    pub fn server_path(&self) -> PathBuf {
        self.data_dir.join(SERVER_DIR).join(SERVER_BINARY)
    }

    fn bundle_start(&self, bundle: &str) -> PathBuf {
        self.data_dir.join(BUNDLES_DIR).join(bundle).join(MARKER_FILE)
    }

    /// Validate that both teams' bundles are provisioned locally.
    ///
    /// No dynamic fetch happens here: provisioning is the provisioner's
    /// job, run out of band via UPDATE. A missing bundle fails the job
    /// immediately.
    pub fn check_assets(&self) -> NodeResult<()> {
        for bundle in [&self.dispatch.left_bundle, &self.dispatch.right_bundle] {
            let start = self.bundle_start(bundle);
            if !start.exists() {
                return Err(NodeError::MissingAsset(format!(
                    "bundle {bundle} has no {MARKER_FILE} at {}",
                    start.display()
                )));
            }
        }
        Ok(())
    }

    /// The deterministic server command line for this match.
    ///
    /// Embeds the assigned port triple, both team start scripts, and the
    /// log directory; caller-supplied `server_flags` come last.
    pub fn server_args(&self) -> Vec<String> {
        let log_dir = self.log_dir();
        let team_start = |bundle: &str, name: &str, config: &Option<String>| {
            let mut start = format!(
                "{} -p {} -t {name}",
                self.bundle_start(bundle).display(),
                self.ports.primary
            );
            if let Some(config) = config {
                if config != "{}" {
                    start.push_str(&format!(" -j {config}"));
                }
            }
            start
        };

        let d = &self.dispatch;
        let mut args = vec![
            "--server::auto_mode=true".to_string(),
            "--server::synch_mode=true".to_string(),
            format!(
                "--server::team_l_start={}",
                team_start(&d.left_bundle, &d.left_team_name, &d.left_config)
            ),
            format!(
                "--server::team_r_start={}",
                team_start(&d.right_bundle, &d.right_team_name, &d.right_config)
            ),
            format!("--server::game_log_dir={}", log_dir.display()),
            format!("--server::text_log_dir={}", log_dir.display()),
            "--server::half_time=100".to_string(),
            "--server::nr_normal_halfs=2".to_string(),
            "--server::nr_extra_halfs=0".to_string(),
            "--server::penalty_shoot_outs=0".to_string(),
            format!("--server::port={}", self.ports.primary),
            format!("--server::coach_port={}", self.ports.coach),
            format!("--server::olcoach_port={}", self.ports.observer),
        ];
        args.extend(d.server_flags.split_whitespace().map(str::to_string));
        args
    }
}

/// Run one match to completion: spawn the server, await its exit, then
/// finalize the result artifact.
///
/// `stop` lets the owner kill the child early (single-job stop); the
/// normal finalization path still runs afterwards, so the port is
/// released through the same single exit.
pub async fn supervise(
    spec: &GameSpec,
    mut stop: oneshot::Receiver<()>,
) -> NodeResult<MatchScores> {
    let log_dir = spec.log_dir();
    fs::create_dir_all(&log_dir)?;

    let stdout = fs::File::create(log_dir.join("out.txt"))?;
    let stderr = fs::File::create(log_dir.join("err.txt"))?;

    let mut child = Command::new(spec.server_path())
        .args(spec.server_args())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|e| NodeError::ProcessSpawnFailed(e.to_string()))?;

    info!(job_id = spec.job_id, port = spec.ports.primary, "server process spawned");

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = &mut stop => {
            warn!(job_id = spec.job_id, "stop requested, killing server process");
            child.start_kill()?;
            child.wait().await?
        }
    };

    debug!(job_id = spec.job_id, code = ?status.code(), "server process exited");
    finalize(spec)
}

/// Scan the log directory for the result artifact and package the logs.
///
/// Any exit code reaches this point; what decides success is the
/// artifact: present, complete, and naming both teams.
fn finalize(spec: &GameSpec) -> NodeResult<MatchScores> {
    let log_dir = spec.log_dir();
    let artifact = find_artifact(&log_dir)?
        .ok_or_else(|| NodeError::IncompleteArtifact("no result artifact found".into()))?;

    if artifact.contains(INCOMPLETE_MARKER) {
        return Err(NodeError::IncompleteArtifact(artifact));
    }
    let d = &spec.dispatch;
    if !artifact.contains(&d.left_team_name) || !artifact.contains(&d.right_team_name) {
        return Err(NodeError::IncompleteArtifact(format!(
            "artifact {artifact} does not name both teams"
        )));
    }

    let scores = parse_artifact_name(&artifact).ok_or_else(|| {
        NodeError::IncompleteArtifact(format!("artifact {artifact} carries no scores"))
    })?;

    let archive = spec.archive_path();
    zip_directory(&log_dir, &archive)?;
    info!(
        job_id = spec.job_id,
        left = scores.left_score,
        right = scores.right_score,
        archive = %archive.display(),
        "match finalized"
    );
    Ok(scores)
}

/// First `.rcg` file name in the log directory, if any.
fn find_artifact(log_dir: &Path) -> NodeResult<Option<String>> {
    if !log_dir.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(&format!(".{ARTIFACT_EXT}")) {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

/// Parse scores from an artifact name of the form
/// `{stamp}-{left}_{score}[_{penalty}]-vs-{right}_{score}[_{penalty}].rcg`.
///
/// Team names may themselves contain underscores, so numeric segments are
/// taken from the right.
fn parse_artifact_name(name: &str) -> Option<MatchScores> {
    let stem = name.strip_suffix(&format!(".{ARTIFACT_EXT}"))?;
    let (left_half, right_half) = stem.split_once("-vs-")?;
    // Drop the leading timestamp from the left half.
    let left_half = left_half.split_once('-').map_or(left_half, |(_, rest)| rest);

    let (left_score, left_penalty) = parse_side(left_half)?;
    let (right_score, right_penalty) = parse_side(right_half)?;
    Some(MatchScores {
        left_score,
        right_score,
        left_penalty,
        right_penalty,
    })
}

/// Trailing numeric segments of one side: `team_3` → (3, None),
/// `team_1_4` → (1, Some(4)).
fn parse_side(side: &str) -> Option<(i32, Option<i32>)> {
    let segments: Vec<&str> = side.split('_').collect();
    let numeric_tail: Vec<i32> = segments
        .iter()
        .rev()
        .map_while(|s| s.parse::<i32>().ok())
        .collect();
    match numeric_tail.len() {
        0 => None,
        1 => Some((numeric_tail[0], None)),
        // Tail was collected right-to-left: [penalty, score, ...].
        _ => Some((numeric_tail[1], Some(numeric_tail[0]))),
    }
}

/// Package a directory into one zip archive, preserving relative paths.
fn zip_directory(dir: &Path, zip_path: &Path) -> NodeResult<()> {
    let file = fs::File::create(zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| NodeError::Archive(e.to_string()))?;
        writer
            .start_file(rel.to_string_lossy(), options)
            .map_err(|e| NodeError::Archive(e.to_string()))?;
        let mut src = fs::File::open(entry.path())?;
        io::copy(&mut src, &mut writer)?;
    }
    writer
        .finish()
        .map_err(|e| NodeError::Archive(e.to_string()))?;
    Ok(())
}

/// Log a finalization failure with the job id attached.
pub(crate) fn log_outcome(job_id: MatchId, result: &NodeResult<MatchScores>) {
    if let Err(e) = result {
        error!(job_id, error = %e, "match failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dispatch() -> JobDispatch {
        JobDispatch {
            job_id: 42,
            left_team_name: "alpha".to_string(),
            right_team_name: "beta".to_string(),
            left_bundle: "cyrus".to_string(),
            right_bundle: "helios".to_string(),
            left_config: None,
            right_config: None,
            server_flags: String::new(),
        }
    }

    fn test_ports() -> PortTriple {
        PortTriple {
            primary: 6000,
            coach: 6001,
            observer: 6002,
        }
    }

    fn provision_bundle(data_dir: &Path, bundle: &str) {
        let dir = data_dir.join(BUNDLES_DIR).join(bundle);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MARKER_FILE), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn parse_plain_scores() {
        let scores = parse_artifact_name("20240101-alpha_2-vs-beta_1.rcg").unwrap();
        assert_eq!(scores.left_score, 2);
        assert_eq!(scores.right_score, 1);
        assert_eq!(scores.left_penalty, None);
        assert_eq!(scores.right_penalty, None);
    }

    #[test]
    fn parse_penalty_scores() {
        let scores = parse_artifact_name("20240101-alpha_1_4-vs-beta_1_3.rcg").unwrap();
        assert_eq!(scores.left_score, 1);
        assert_eq!(scores.right_score, 1);
        assert_eq!(scores.left_penalty, Some(4));
        assert_eq!(scores.right_penalty, Some(3));
    }

    #[test]
    fn parse_team_names_with_underscores() {
        let scores = parse_artifact_name("20240101-red_devils_0-vs-the_b_team_3.rcg").unwrap();
        assert_eq!(scores.left_score, 0);
        assert_eq!(scores.right_score, 3);
    }

    #[test]
    fn parse_rejects_scoreless_names() {
        assert!(parse_artifact_name("alpha-vs-beta.rcg").is_none());
        assert!(parse_artifact_name("not-an-artifact.txt").is_none());
    }

    #[test]
    fn check_assets_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        provision_bundle(dir.path(), "cyrus");
        // "helios" not provisioned.
        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        let err = spec.check_assets().unwrap_err();
        assert!(matches!(err, NodeError::MissingAsset(_)));
    }

    #[test]
    fn check_assets_all_present() {
        let dir = tempfile::tempdir().unwrap();
        provision_bundle(dir.path(), "cyrus");
        provision_bundle(dir.path(), "helios");
        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        spec.check_assets().unwrap();
    }

    #[test]
    fn server_args_embed_ports_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = test_dispatch();
        dispatch.server_flags = "--server::verbose=true".to_string();
        let spec = GameSpec::new(dir.path(), dispatch, test_ports());
        let args = spec.server_args();

        assert!(args.contains(&"--server::port=6000".to_string()));
        assert!(args.contains(&"--server::coach_port=6001".to_string()));
        assert!(args.contains(&"--server::olcoach_port=6002".to_string()));
        assert_eq!(args.last().unwrap(), "--server::verbose=true");
        assert!(args.iter().any(|a| a.starts_with("--server::team_l_start=") && a.contains("-t alpha")));
    }

    #[test]
    fn server_args_skip_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = test_dispatch();
        dispatch.left_config = Some("{}".to_string());
        dispatch.right_config = Some(r#"{"formation":"433"}"#.to_string());
        let spec = GameSpec::new(dir.path(), dispatch, test_ports());
        let args = spec.server_args();

        let left = args.iter().find(|a| a.starts_with("--server::team_l_start=")).unwrap();
        let right = args.iter().find(|a| a.starts_with("--server::team_r_start=")).unwrap();
        assert!(!left.contains("-j"));
        assert!(right.contains(r#"-j {"formation":"433"}"#));
    }

    #[test]
    fn finalize_without_artifact_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        fs::create_dir_all(spec.log_dir()).unwrap();
        let err = finalize(&spec).unwrap_err();
        assert!(matches!(err, NodeError::IncompleteArtifact(_)));
    }

    #[test]
    fn finalize_flags_incomplete_marker() {
        let dir = tempfile::tempdir().unwrap();
        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        fs::create_dir_all(spec.log_dir()).unwrap();
        fs::write(spec.log_dir().join("incomplete_alpha_0-vs-beta_0.rcg"), b"").unwrap();
        let err = finalize(&spec).unwrap_err();
        assert!(matches!(err, NodeError::IncompleteArtifact(_)));
    }

    #[test]
    fn finalize_success_packages_archive() {
        let dir = tempfile::tempdir().unwrap();
        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        fs::create_dir_all(spec.log_dir()).unwrap();
        fs::write(spec.log_dir().join("20240101-alpha_2-vs-beta_0.rcg"), b"log").unwrap();
        fs::write(spec.log_dir().join("out.txt"), b"server output").unwrap();

        let scores = finalize(&spec).unwrap();
        assert_eq!(scores.left_score, 2);
        assert_eq!(scores.right_score, 0);
        assert!(spec.archive_path().exists());
    }

    #[tokio::test]
    async fn supervise_failing_server_reports_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        // A "server" that exits immediately without writing an artifact.
        let server_dir = dir.path().join(SERVER_DIR);
        fs::create_dir_all(&server_dir).unwrap();
        let server = server_dir.join(SERVER_BINARY);
        fs::write(&server, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&server, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        let (_tx, rx) = oneshot::channel();
        let err = supervise(&spec, rx).await.unwrap_err();
        assert!(matches!(err, NodeError::IncompleteArtifact(_)));
        // stdout/stderr capture files exist even on failure.
        assert!(spec.log_dir().join("out.txt").exists());
    }

    #[tokio::test]
    async fn supervise_missing_binary_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = GameSpec::new(dir.path(), test_dispatch(), test_ports());
        let (_tx, rx) = oneshot::channel();
        let err = supervise(&spec, rx).await.unwrap_err();
        assert!(matches!(err, NodeError::ProcessSpawnFailed(_)));
    }
}
