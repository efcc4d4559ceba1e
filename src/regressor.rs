use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

const ZERO_THRESHOLD: f64 = 1e-35;
const CATEGORICAL_MASK: u8 = 1;
const DEFAULT_LEFT_MASK: u8 = 2;
const MISSING_ZERO: u8 = 1;
const MISSING_NAN: u8 = 2;

/// A point regressor over dense feature rows.
pub trait Regressor: Send + Sync {
    fn fit(&mut self, features: &[Vec<f64>], target: &[f64]) -> Result<()>;
    fn predict(&self, features: &[f64]) -> Result<f64>;
}

/// Builds fresh, unfitted regressors for a hyperparameter configuration.
pub trait RegressorFactory: Send + Sync {
    fn build(&self, params: &LightgbmParams) -> Result<Box<dyn Regressor>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightgbmParams {
    pub n_estimators: usize,
    pub max_depth: i32,
    pub min_child_samples: usize,
    pub learning_rate: f64,
    pub feature_fraction: f64,
    pub num_leaves: usize,
    pub reg_alpha: f64,
    pub reg_lambda: f64,
    pub max_bin: usize,
    pub random_state: u64,
    pub verbose: i32,
}

impl Default for LightgbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: -1,
            min_child_samples: 20,
            learning_rate: 0.1,
            feature_fraction: 1.0,
            num_leaves: 31,
            reg_alpha: 0.0,
            reg_lambda: 0.0,
            max_bin: 255,
            random_state: 0,
            verbose: -1,
        }
    }
}

impl LightgbmParams {
    /// Training parameters in the command-line trainer's vocabulary.
    pub fn cli_args(&self) -> Vec<String> {
        vec![
            String::from("task=train"),
            String::from("objective=regression"),
            format!("num_iterations={}", self.n_estimators),
            format!("max_depth={}", self.max_depth),
            format!("min_data_in_leaf={}", self.min_child_samples),
            format!("learning_rate={}", self.learning_rate),
            format!("feature_fraction={}", self.feature_fraction),
            format!("num_leaves={}", self.num_leaves),
            format!("lambda_l1={}", self.reg_alpha),
            format!("lambda_l2={}", self.reg_lambda),
            format!("max_bin={}", self.max_bin),
            format!("seed={}", self.random_state),
            String::from("deterministic=true"),
            format!("verbosity={}", self.verbose),
        ]
    }
}

pub fn resolve_lightgbm_executable(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(anyhow!(
            "LIGHTGBM_EXECUTABLE points to {}, which does not exist",
            path.display()
        ));
    }

    let binary = if cfg!(windows) {
        "lightgbm.exe"
    } else {
        "lightgbm"
    };
    let vendor_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("vendor")
        .join(binary);
    if vendor_path.exists() {
        return Ok(vendor_path);
    }

    if let Some(path) = find_in_path(binary) {
        return Ok(path);
    }

    Err(anyhow!(
        "lightgbm executable not found in vendor/ or PATH; install the LightGBM CLI or set LIGHTGBM_EXECUTABLE"
    ))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_value = std::env::var_os("PATH")?;
    std::env::split_paths(&path_value)
        .map(|entry| entry.join(binary))
        .find(|candidate| candidate.exists())
}

/// Factory for regressors trained by the LightGBM command-line tool.
///
/// The executable is looked up when the first regressor is built, so a run
/// that fails on its input never needs the trainer installed.
#[derive(Debug, Default)]
pub struct LightgbmFactory {
    explicit: Option<PathBuf>,
    executable: OnceLock<PathBuf>,
}

impl LightgbmFactory {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            executable: OnceLock::new(),
        }
    }

    fn executable(&self) -> Result<PathBuf> {
        if let Some(path) = self.executable.get() {
            return Ok(path.clone());
        }
        let path = resolve_lightgbm_executable(self.explicit.as_deref())?;
        info!("Using LightGBM executable at {}", path.display());
        Ok(self.executable.get_or_init(|| path).clone())
    }
}

impl RegressorFactory for LightgbmFactory {
    fn build(&self, params: &LightgbmParams) -> Result<Box<dyn Regressor>> {
        Ok(Box::new(LightgbmRegressor::new(
            self.executable()?,
            params.clone(),
        )))
    }
}

pub struct LightgbmRegressor {
    executable: PathBuf,
    params: LightgbmParams,
    booster: Option<LightgbmBooster>,
}

impl LightgbmRegressor {
    pub fn new(executable: PathBuf, params: LightgbmParams) -> Self {
        Self {
            executable,
            params,
            booster: None,
        }
    }

    fn train(&self, dataset_path: &Path, model_path: &Path) -> Result<String> {
        let mut args = self.params.cli_args();
        args.push(format!("data={}", dataset_path.to_string_lossy()));
        args.push(format!("output_model={}", model_path.to_string_lossy()));

        let output = Command::new(&self.executable)
            .args(&args)
            .output()
            .with_context(|| format!("Failed to spawn {}", self.executable.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(anyhow!(
                "LightGBM training failed with status {}: {}",
                output.status,
                detail
            ));
        }

        fs::read_to_string(model_path)
            .with_context(|| format!("Failed to read LightGBM model {}", model_path.display()))
    }
}

impl Regressor for LightgbmRegressor {
    fn fit(&mut self, features: &[Vec<f64>], target: &[f64]) -> Result<()> {
        if features.is_empty() {
            return Err(anyhow!("Cannot train LightGBM on an empty dataset"));
        }
        if features.len() != target.len() {
            return Err(anyhow!(
                "Feature rows ({}) and target values ({}) differ in length",
                features.len(),
                target.len()
            ));
        }

        let dataset_path =
            std::env::temp_dir().join(format!("lightgbm_forecast_{}.svm", Uuid::new_v4()));
        let model_path =
            std::env::temp_dir().join(format!("lightgbm_forecast_{}.txt", Uuid::new_v4()));
        debug!(
            "Writing {} training rows to {}",
            features.len(),
            dataset_path.display()
        );

        let result = write_libsvm_dataset(features, target, &dataset_path)
            .and_then(|_| self.train(&dataset_path, &model_path));
        let _ = fs::remove_file(&dataset_path);
        let _ = fs::remove_file(&model_path);

        let booster = LightgbmBooster::from_model_text(&result?)?;
        let expected = features[0].len();
        if booster.num_features() > expected {
            return Err(anyhow!(
                "LightGBM model expects {} features but {} were supplied",
                booster.num_features(),
                expected
            ));
        }
        self.booster = Some(booster);
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> Result<f64> {
        let booster = self
            .booster
            .as_ref()
            .ok_or_else(|| anyhow!("LightGBM regressor used before fit"))?;
        booster.predict(features)
    }
}

fn write_libsvm_dataset(features: &[Vec<f64>], target: &[f64], path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    for (row, label) in features.iter().zip(target) {
        let mut line = format!("{}", label);
        for (idx, value) in row.iter().enumerate() {
            line.push(' ');
            if value.is_nan() {
                line.push_str(&format!("{}:nan", idx));
            } else {
                line.push_str(&format!("{}:{:.10}", idx, value));
            }
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }

    writer.flush()?;
    Ok(())
}

#[derive(Debug)]
struct LightgbmTree {
    split_features: Vec<usize>,
    thresholds: Vec<f64>,
    decision_types: Vec<u8>,
    left_child: Vec<i32>,
    right_child: Vec<i32>,
    leaf_values: Vec<f64>,
}

impl LightgbmTree {
    fn from_lines(lines: &mut std::iter::Peekable<std::str::Lines<'_>>) -> Result<Self> {
        let mut num_leaves: Option<usize> = None;
        let mut split_features = Vec::new();
        let mut thresholds = Vec::new();
        let mut decision_types = Vec::new();
        let mut left_child = Vec::new();
        let mut right_child = Vec::new();
        let mut leaf_values = Vec::new();

        while let Some(peeked) = lines.peek() {
            if peeked.starts_with("Tree=") || peeked.starts_with("end of trees") {
                break;
            }
            let Some(line) = lines.next() else {
                break;
            };
            let line = line.trim();

            if line.starts_with("num_leaves=") {
                num_leaves = Some(parse_value(line, "num_leaves=")?);
            } else if line.starts_with("num_cat=") {
                let num_cat: usize = parse_value(line, "num_cat=")?;
                if num_cat > 0 {
                    return Err(anyhow!(
                        "LightGBM model uses categorical splits, which are not supported"
                    ));
                }
            } else if line.starts_with("split_feature=") {
                split_features = parse_array(line, "split_feature=")?;
            } else if line.starts_with("threshold=") {
                thresholds = parse_array(line, "threshold=")?;
            } else if line.starts_with("decision_type=") {
                decision_types = parse_array(line, "decision_type=")?;
            } else if line.starts_with("left_child=") {
                left_child = parse_array(line, "left_child=")?;
            } else if line.starts_with("right_child=") {
                right_child = parse_array(line, "right_child=")?;
            } else if line.starts_with("leaf_value=") {
                leaf_values = parse_array(line, "leaf_value=")?;
            }
        }

        let internal_nodes = split_features.len();
        if decision_types.is_empty() {
            decision_types = vec![0; internal_nodes];
        }
        if thresholds.len() != internal_nodes
            || decision_types.len() != internal_nodes
            || left_child.len() != internal_nodes
            || right_child.len() != internal_nodes
        {
            return Err(anyhow!(
                "LightGBM tree definition invalid: split/child/threshold length mismatch"
            ));
        }
        if decision_types
            .iter()
            .any(|decision| decision & CATEGORICAL_MASK != 0)
        {
            return Err(anyhow!(
                "LightGBM model uses categorical splits, which are not supported"
            ));
        }

        let declared_leaves = num_leaves.unwrap_or(leaf_values.len());
        if declared_leaves != leaf_values.len() || leaf_values.is_empty() {
            return Err(anyhow!(
                "LightGBM tree leaf count mismatch: expected {declared_leaves}, found {}",
                leaf_values.len()
            ));
        }
        if internal_nodes > 0 && internal_nodes + 1 != leaf_values.len() {
            return Err(anyhow!(
                "LightGBM tree has {} splits but {} leaves",
                internal_nodes,
                leaf_values.len()
            ));
        }

        Ok(Self {
            split_features,
            thresholds,
            decision_types,
            left_child,
            right_child,
            leaf_values,
        })
    }

    fn next_node(&self, node_idx: usize, features: &[f64]) -> i32 {
        let decision = self.decision_types[node_idx];
        let missing_type = (decision >> 2) & 3;
        let default_left = decision & DEFAULT_LEFT_MASK != 0;
        let mut value = features
            .get(self.split_features[node_idx])
            .copied()
            .unwrap_or(0.0);

        if value.is_nan() && missing_type != MISSING_NAN {
            value = 0.0;
        }
        let goes_default = (missing_type == MISSING_ZERO && value.abs() <= ZERO_THRESHOLD)
            || (missing_type == MISSING_NAN && value.is_nan());
        let go_left = if goes_default {
            default_left
        } else {
            value <= self.thresholds[node_idx]
        };

        if go_left {
            self.left_child[node_idx]
        } else {
            self.right_child[node_idx]
        }
    }

    fn predict(&self, features: &[f64]) -> f64 {
        if self.split_features.is_empty() {
            return self.leaf_values[0];
        }
        let mut node_idx = 0usize;
        // A well-formed tree reaches a leaf within `internal_nodes` steps.
        for _ in 0..=self.split_features.len() {
            let child = self.next_node(node_idx, features);
            if child < 0 {
                let leaf_idx = (-child - 1) as usize;
                return self.leaf_values.get(leaf_idx).copied().unwrap_or_default();
            }
            node_idx = child as usize;
            if node_idx >= self.split_features.len() {
                break;
            }
        }
        f64::NAN
    }
}

/// In-process scorer for a LightGBM regression model file.
///
/// Leaf values in the model text already include shrinkage, so the raw score
/// is the plain sum of the leaves reached in every tree.
#[derive(Debug)]
pub struct LightgbmBooster {
    trees: Vec<LightgbmTree>,
    feature_count: usize,
}

impl LightgbmBooster {
    pub fn from_model_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with("objective=") {
                let objective = trimmed.trim_start_matches("objective=");
                if !objective.starts_with("regression") {
                    return Err(anyhow!(
                        "Expected a regression model, found objective {}",
                        objective
                    ));
                }
            } else if trimmed.starts_with("max_feature_idx=") {
                max_feature_idx = Some(parse_value(trimmed, "max_feature_idx=")?);
            } else if trimmed.starts_with("Tree=") {
                trees.push(LightgbmTree::from_lines(&mut lines)?);
            } else if trimmed.starts_with("end of trees") {
                break;
            }
        }

        if trees.is_empty() {
            return Err(anyhow!("LightGBM model contained no trees"));
        }

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_features.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let feature_count = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);

        Ok(Self {
            trees,
            feature_count,
        })
    }

    pub fn num_features(&self) -> usize {
        self.feature_count
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn predict(&self, features: &[f64]) -> Result<f64> {
        if features.len() < self.feature_count {
            return Err(anyhow!(
                "LightGBM model expects {} features, got {}",
                self.feature_count,
                features.len()
            ));
        }
        let score: f64 = self.trees.iter().map(|tree| tree.predict(features)).sum();
        if !score.is_finite() {
            return Err(anyhow!("LightGBM model produced a non-finite prediction"));
        }
        Ok(score)
    }
}

fn parse_value<T>(line: &str, prefix: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Expected prefix {prefix}"))?;
    raw.trim().parse::<T>().map_err(|err| {
        anyhow!(
            "Failed to parse value for {prefix} from \"{line}\" while loading LightGBM model: {err}"
        )
    })
}

fn parse_array<T>(line: &str, prefix: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Expected prefix {prefix}"))?;
    raw.split_whitespace()
        .map(|token| {
            token
                .parse::<T>()
                .map_err(|err| anyhow!("Failed to parse value {token} for {prefix}: {err}"))
        })
        .collect()
}
