//! CSV fixtures and configuration helpers

use std::path::{Path, PathBuf};

use batch_enrich::{Config, RateLimitConfig};

/// Header of every generated lead list
pub const LEADS_HEADER: &str = "Name,Email,Company";

/// Write a lead list with `rows` data rows and return its path
///
/// Row `i` has name `lead{i}`. Every fourth row uses a `.net` domain (the
/// enrichers below classify those as failures) and every tenth row has no
/// email at all.
pub fn write_leads(dir: &Path, name: &str, rows: usize) -> PathBuf {
    let path = dir.join(name);
    let mut content = format!("{LEADS_HEADER}\n");
    for i in 0..rows {
        let email = if i % 10 == 9 {
            String::new()
        } else if i % 4 == 0 {
            format!("lead{i}@example.net")
        } else {
            format!("lead{i}@example.io")
        };
        content.push_str(&format!("lead{i},{email},\"Company {i}, Inc\"\n"));
    }
    std::fs::write(&path, content).expect("write leads fixture");
    path
}

/// Configuration used by the scenario tests: no rate limit, 8 workers, a
/// `Domain` augmentation column
pub fn test_config() -> Config {
    let mut config = Config {
        rate_limit: RateLimitConfig::Unlimited,
        ..Config::default()
    };
    config.workers.concurrency = 8;
    config.output.extra_columns = vec!["Domain".to_string()];
    config
}

/// Data rows of a CSV file
pub fn read_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).expect("open csv");
    reader
        .records()
        .map(|r| {
            r.expect("csv record")
                .iter()
                .map(str::to_string)
                .collect()
        })
        .collect()
}

/// Header row of a CSV file
pub fn read_header(path: &Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).expect("open csv");
    reader
        .headers()
        .expect("csv header")
        .iter()
        .map(str::to_string)
        .collect()
}

/// Sorted names of the checkpoint files in `dir`
pub fn checkpoint_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("_backup_"))
        .collect();
    names.sort();
    names
}

/// Names of the shard workspaces left in `dir`
pub fn shard_workspaces(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".shards-"))
        .collect()
}
