//! Dry-run reports and Parquet snapshots of run evaluations.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use reelgate_core::{MediaCatalogEvaluation, PolicyConfig};
use reelgate_storage::EvaluationQuery;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::{CatalogEngine, PreviewReport};

const EXPORT_PAGE: usize = 1_000;

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable content hash of a policy configuration.
pub fn policy_fingerprint(config: &PolicyConfig) -> Result<String> {
    let bytes = serde_json::to_vec(config).context("serializing policy config")?;
    Ok(sha256_hex(&bytes))
}

#[derive(Serialize)]
struct PreviewEnvelope<'a> {
    generated_at: DateTime<Utc>,
    policy_fingerprint: String,
    policy: &'a PolicyConfig,
    report: &'a PreviewReport,
}

/// Writes `preview.json` and `summary.md` under `<dir>/previews/<stamp>-<fingerprint>/`.
pub async fn write_preview_report(dir: &Path, config: &PolicyConfig, report: &PreviewReport) -> Result<PathBuf> {
    let generated_at = Utc::now();
    let fingerprint = policy_fingerprint(config)?;
    let out = dir.join("previews").join(format!(
        "{}-{}",
        generated_at.format("%Y%m%d_%H%M%S"),
        &fingerprint[..12]
    ));
    fs::create_dir_all(&out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;

    let envelope = PreviewEnvelope {
        generated_at,
        policy_fingerprint: fingerprint.clone(),
        policy: config,
        report,
    };
    let json_path = out.join("preview.json");
    let bytes = serde_json::to_vec_pretty(&envelope).context("serializing preview report")?;
    fs::write(&json_path, bytes)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let md_path = out.join("summary.md");
    fs::write(&md_path, summary_markdown(&fingerprint, report))
        .await
        .with_context(|| format!("writing {}", md_path.display()))?;

    info!(path = %out.display(), evaluated = report.summary.evaluated, "wrote dry run report");
    Ok(out)
}

fn summary_markdown(fingerprint: &str, report: &PreviewReport) -> String {
    let s = &report.summary;
    let mut lines = vec![
        "# Policy Dry Run".to_string(),
        String::new(),
        format!("- policy fingerprint: `{fingerprint}`"),
        format!("- mode: `{:?}`", report.mode),
        format!(
            "- baseline version: {}",
            s.baseline_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string())
        ),
        format!("- evaluated: {}{}", s.evaluated, if s.truncated { " (truncated)" } else { "" }),
        format!("- newly eligible: {}", s.newly_eligible),
        format!("- newly ineligible: {}", s.newly_ineligible),
        format!("- unchanged: {}", s.unchanged),
        format!("- changed otherwise: {}", s.changed),
        format!("- evaluation errors: {}", s.evaluation_errors),
        String::new(),
        "## Proposed status".to_string(),
    ];
    for (status, count) in &s.by_status {
        lines.push(format!("- {status}: {count}"));
    }
    lines.push(String::new());
    lines.push("## Reasons".to_string());
    for (reason, count) in &s.reason_histogram {
        lines.push(format!("- `{reason}`: {count}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub policy_version: i32,
    pub rows: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Exports every evaluation written by `run_id` to Parquet with a manifest.
pub async fn export_run_snapshot(engine: &CatalogEngine, run_id: Uuid, reports_dir: &Path) -> Result<PathBuf> {
    let run = engine.get_run(run_id).await?;

    let mut rows = Vec::new();
    let mut query = EvaluationQuery::for_version(run.target_policy_version, EXPORT_PAGE);
    query.run_id = Some(run_id);
    loop {
        let page = engine.stores().evaluations.list(&query).await?;
        let Some(last) = page.last() else { break };
        query.after = Some(last.media_item_id);
        let done = page.len() < EXPORT_PAGE;
        rows.extend(page);
        if done {
            break;
        }
    }

    let snapshot_dir = reports_dir.join("runs").join(run_id.to_string());
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let evaluations_path = snapshot_dir.join("evaluations.parquet");
    write_evaluations_parquet(&evaluations_path, &rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        policy_version: run.target_policy_version,
        rows: rows.len(),
        files: vec![manifest_entry("evaluations", reports_dir, &evaluations_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(%run_id, rows = rows.len(), path = %manifest_path.display(), "exported run snapshot");
    Ok(manifest_path)
}

fn write_evaluations_parquet(path: &Path, rows: &[MediaCatalogEvaluation]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("media_item_id", DataType::Utf8, false),
        ArrowField::new("policy_version", DataType::Int32, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("reasons", DataType::Utf8, false),
        ArrowField::new("relevance_score", DataType::Float64, false),
        ArrowField::new("breakout_rule_id", DataType::Utf8, true),
        ArrowField::new("evaluated_at", DataType::Utf8, true),
    ]));

    let ids = StringArray::from(rows.iter().map(|r| Some(r.media_item_id.to_string())).collect::<Vec<_>>());
    let versions = Int32Array::from(rows.iter().map(|r| r.policy_version).collect::<Vec<_>>());
    let statuses = StringArray::from(rows.iter().map(|r| Some(r.status.as_str())).collect::<Vec<_>>());
    let reasons = StringArray::from(
        rows.iter()
            .map(|r| {
                Some(
                    r.reasons
                        .iter()
                        .map(|reason| reason.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                )
            })
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(rows.iter().map(|r| r.relevance_score).collect::<Vec<_>>());
    let rules = StringArray::from(rows.iter().map(|r| r.breakout_rule_id.as_deref()).collect::<Vec<_>>());
    let evaluated_at = StringArray::from(
        rows.iter()
            .map(|r| r.evaluated_at.map(|at| at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(versions),
            Arc::new(statuses),
            Arc::new(reasons),
            Arc::new(scores),
            Arc::new(rules),
            Arc::new(evaluated_at),
        ],
    )
    .context("building evaluations record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
