//! Annotation progress for one project version.
//!
//! Used by `lbl stats` to show how far each annotator has come. Counts
//! only ids that still exist in the version's source files, so records for
//! items that were never part of this version do not inflate the numbers.

use std::collections::HashSet;

use anyhow::Result;
use label_ledger_core::models::{Annotator, Project};

use crate::ledger::Ledger;

/// One annotator's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatorProgress {
    pub annotator: Annotator,
    pub annotated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectStats {
    pub name: String,
    pub version: String,
    pub total_items: usize,
    pub annotators: Vec<AnnotatorProgress>,
}

impl ProjectStats {
    pub fn percent(&self, progress: &AnnotatorProgress) -> u64 {
        if self.total_items == 0 {
            0
        } else {
            (progress.annotated as u64 * 100) / self.total_items as u64
        }
    }
}

pub fn collect_stats(ledger: &Ledger, project: &Project) -> Result<ProjectStats> {
    let ids: HashSet<String> = ledger
        .item_entries(project)?
        .into_iter()
        .map(|(_, id)| id)
        .collect();

    let mut annotators = Vec::new();
    for annotator in ledger.annotations().annotators(project)? {
        let annotated = ledger
            .annotations()
            .annotated_ids(project, &annotator)?
            .iter()
            .filter(|id| ids.contains(*id))
            .count();
        annotators.push(AnnotatorProgress {
            annotator,
            annotated,
        });
    }
    annotators.sort_by(|a, b| {
        b.annotated
            .cmp(&a.annotated)
            .then_with(|| a.annotator.cmp(&b.annotator))
    });

    Ok(ProjectStats {
        name: project.name.clone(),
        version: project.version.clone(),
        total_items: ids.len(),
        annotators,
    })
}

pub fn print_stats(stats: &ProjectStats) {
    println!("{} ({})", stats.name, stats.version);
    println!("{}", "=".repeat(stats.name.len() + stats.version.len() + 3));
    println!();
    println!("  Items:       {}", stats.total_items);
    println!("  Annotators:  {}", stats.annotators.len());

    if !stats.annotators.is_empty() {
        println!();
        println!("  {:<24} {:>9} {:>6}", "ANNOTATOR", "ANNOTATED", "DONE");
        println!("  {}", "-".repeat(41));
        for progress in &stats.annotators {
            println!(
                "  {:<24} {:>9} {:>5}%",
                progress.annotator.login(),
                progress.annotated,
                stats.percent(progress)
            );
        }
    }
    println!();
}
