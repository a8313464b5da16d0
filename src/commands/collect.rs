use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::CollectArgs;
use crate::commands::{COLLECT_MANIFEST_PREFIX, MANIFEST_VERSION, manifest_path};
use crate::grouping::group_elements;
use crate::model::{CollectPaths, CollectRunManifest};
use crate::overpass::{OverpassClient, build_city_query, read_elements_file};
use crate::report::{build_report, write_report};
use crate::util::{
    ensure_directory, file_stem_for, now_utc_string, sha256_file, utc_compact_string,
    write_json_pretty,
};

pub fn run(args: CollectArgs) -> Result<()> {
    execute(&args)?;
    Ok(())
}

pub fn execute(args: &CollectArgs) -> Result<CollectRunManifest> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("collect-{}", utc_compact_string(started_ts));

    ensure_directory(&args.output_dir)?;
    let report_path = args.report_path.clone().unwrap_or_else(|| {
        args.output_dir
            .join(format!("report_{}.csv", file_stem_for(&args.city)))
    });

    info!(city = %args.city, run_id = %run_id, "starting collect");

    let fetch_started = Instant::now();
    let (elements, source) = match &args.elements_file {
        Some(path) => {
            info!(path = %path.display(), "reading elements from file");
            (read_elements_file(path)?, format!("file:{}", path.display()))
        }
        None => {
            let client = OverpassClient::new(
                &args.overpass_url,
                Duration::from_secs(args.http_timeout_secs),
            )?;
            let query = build_city_query(&args.city, args.query_timeout_secs);
            let elements = client
                .fetch_elements(&query)
                .with_context(|| format!("failed to fetch buildings for {}", args.city))?;
            (elements, args.overpass_url.clone())
        }
    };
    let fetch_duration_ms = fetch_started.elapsed().as_millis();
    info!(
        elements = elements.len(),
        elapsed_ms = fetch_duration_ms,
        "element stream loaded"
    );

    let (groups, stats) = group_elements(elements);
    info!(
        structural = stats.structural_elements,
        nodes = stats.node_elements,
        groups = stats.groups_emitted,
        without_organizations = stats.structures_without_organizations,
        trailing_nodes = stats.trailing_nodes_dropped,
        "grouped elements into buildings"
    );

    let mut warnings = Vec::new();
    if stats.trailing_nodes_dropped > 0 {
        warn!(
            count = stats.trailing_nodes_dropped,
            "nodes after the last building were dropped"
        );
        warnings.push(format!(
            "{} trailing node(s) had no building and were dropped",
            stats.trailing_nodes_dropped
        ));
    }

    let rows = build_report(groups);
    if rows.is_empty() {
        warn!(city = %args.city, "no building with organizations found");
        warnings.push("report has no rows".to_string());
    }

    write_report(&report_path, &rows)?;
    let report_sha256 = sha256_file(&report_path)?;
    info!(path = %report_path.display(), rows = rows.len(), "wrote report");

    let manifest = CollectRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id,
        city: args.city.clone(),
        source,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        fetch_duration_ms,
        paths: CollectPaths {
            output_dir: args.output_dir.display().to_string(),
            report_path: report_path.display().to_string(),
            elements_file: args
                .elements_file
                .as_ref()
                .map(|path| path.display().to_string()),
        },
        counts: stats,
        report_rows: rows.len(),
        report_sha256,
        warnings,
    };

    let manifest_path = manifest_path(
        &args.output_dir,
        COLLECT_MANIFEST_PREFIX,
        &utc_compact_string(started_ts),
    );
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote collect manifest");

    Ok(manifest)
}
