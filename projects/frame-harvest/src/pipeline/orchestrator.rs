// Run lifecycle: discover, filter, probe, build units, schedule, report
//
// Ledgered and excluded videos are dropped before probing so finished work
// costs nothing on a rerun.

use crate::config::RunConfig;
use crate::error::ExtractError;
use crate::ledger::ProcessingLedger;
use crate::pipeline::scheduler::{AcceleratorScheduler, SchedulerOptions};
use crate::pipeline::types::RunProgress;
use crate::pipeline::units::UnitBuilder;
use crate::pipeline::worker::{ExtractionExecutor, UnitExecutor};
use crate::run_artifacts::{RunReport, SkipReason, SkippedVideo};
use crate::run_context::{list_videos, partition_excluded};
use crate::summary::SummaryReporter;
use crate::video::probe::{self, VideoInfo};
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Runs a full extraction pass with the production decoder and detector.
pub fn run_extraction(config: Arc<RunConfig>, progress: Arc<RunProgress>) -> Result<RunReport> {
    let executor = Arc::new(ExtractionExecutor::new(config.clone()));
    run_with(&config, executor, progress, probe::probe)
}

pub fn run_with<P>(
    config: &RunConfig,
    executor: Arc<dyn UnitExecutor>,
    progress: Arc<RunProgress>,
    probe: P,
) -> Result<RunReport>
where
    P: Fn(&Path) -> Result<VideoInfo, ExtractError>,
{
    let started_at = Utc::now();
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", config.log_dir))?;

    let mut ledger = ProcessingLedger::open(&config.ledger_path())?;
    let mut report = RunReport {
        started_at,
        finished_at: started_at,
        mode: config.mode,
        root_category: config.root_category.clone(),
        input_root: config.input_root.clone(),
        output_root: config.output_root.clone(),
        skipped: Vec::new(),
        videos: Vec::new(),
        failures: Vec::new(),
        peak_in_flight: BTreeMap::new(),
        frames_by_category: BTreeMap::new(),
        total_frames: 0,
    };

    let discovered = list_videos(&config.input_root, &config.root_category);
    tracing::info!(
        "Found {} video(s) under {:?}",
        discovered.len(),
        config.input_root
    );

    let (candidates, excluded) = partition_excluded(discovered, &config.excluded_categories);
    for source in excluded {
        tracing::info!("Skipping {} (excluded category)", source.key);
        report.skipped.push(SkippedVideo {
            video: source.key,
            reason: SkipReason::Excluded,
            detail: None,
        });
    }

    let mut builder = UnitBuilder::new(config);
    let mut units = Vec::new();
    for source in candidates {
        if ledger.contains(&source.key) {
            tracing::debug!("Skipping {} (already processed)", source.key);
            report.skipped.push(SkippedVideo {
                video: source.key,
                reason: SkipReason::AlreadyProcessed,
                detail: None,
            });
            continue;
        }

        match probe(&source.path) {
            Ok(info) => {
                let built = builder.build(&source, info);
                tracing::info!(
                    video = %source.key,
                    "{:.0}s at {:.2} fps, {} frames -> {} unit(s) on {}",
                    info.duration_sec,
                    info.fps,
                    info.frame_count,
                    built.len(),
                    built.first().map(|u| u.accelerator.to_string()).unwrap_or_default()
                );
                units.extend(built);
            }
            Err(e) => {
                tracing::warn!(video = %source.key, "Skipping unreadable video: {}", e);
                report.skipped.push(SkippedVideo {
                    video: source.key,
                    reason: SkipReason::Unreadable,
                    detail: Some(e.to_string()),
                });
            }
        }
    }

    tracing::info!(
        "{} already processed, {} excluded, {} unreadable, {} unit(s) to run",
        report.skipped_count(SkipReason::AlreadyProcessed),
        report.skipped_count(SkipReason::Excluded),
        report.skipped_count(SkipReason::Unreadable),
        units.len()
    );

    let scheduler = AcceleratorScheduler::new(SchedulerOptions::from(config), executor, progress);
    let outcome = scheduler.run(units, &mut ledger)?;

    let mut summary = SummaryReporter::new();
    for video in outcome.done() {
        summary.record(&video.video.sub_category, video.frames_written);
    }
    summary.append_to(&config.summary_path(), &config.root_category, Local::now())?;

    report.absorb(outcome);
    report.frames_by_category = summary.counts().clone();
    report.total_frames = summary.total();
    report.finished_at = Utc::now();

    let path = report.save(&config.log_dir)?;
    tracing::info!(
        "Run finished: {} video(s) done, {} failure(s), {} frames; report at {:?}",
        report.videos.iter().filter(|v| v.ledgered).count(),
        report.failures.len(),
        report.total_frames,
        path
    );

    Ok(report)
}
