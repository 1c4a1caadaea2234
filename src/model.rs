use crate::classification::{ActivityLabel, Classifier, FeatureVector, FEATURE_NAMES};
use crate::error::{ClassifyError, ModelError};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One node of a decision tree as exported by the training procedure.
/// Samples with `value <= threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        class: usize,
    },
}

/// On-disk model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelFile {
    /// Ascending thresholds on a single feature separating the four levels
    Cutpoints {
        version: String,
        feature: String,
        cutpoints: Vec<f32>,
    },
    Forest {
        version: String,
        /// Names of the features the node indices refer to
        feature_names: Vec<String>,
        classes: Vec<ActivityLabel>,
        trees: Vec<Vec<TreeNode>>,
    },
}

#[derive(Debug, Clone)]
pub struct CutpointModel {
    version: String,
    feature: usize,
    cutpoints: [f32; 3],
}

#[derive(Debug, Clone)]
pub struct ForestModel {
    version: String,
    /// Position in the feature vector for each model feature
    columns: Vec<usize>,
    classes: Vec<ActivityLabel>,
    trees: Vec<Vec<TreeNode>>,
}

/// A validated, ready to use model.
#[derive(Debug, Clone)]
pub enum TrainedModel {
    Cutpoints(CutpointModel),
    Forest(ForestModel),
}

impl TrainedModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_json(&text)?;
        info!("Loaded model {} from {}", model.version(), path.display());
        Ok(model)
    }

    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        let file: ModelFile = serde_json::from_str(text)?;
        Self::from_file(file)
    }

    pub fn from_file(file: ModelFile) -> Result<Self, ModelError> {
        match file {
            ModelFile::Cutpoints {
                version,
                feature,
                cutpoints,
            } => {
                let index = FeatureVector::index_of(&feature)
                    .ok_or_else(|| unknown_feature(&feature))?;
                let cutpoints: [f32; 3] = cutpoints.try_into().map_err(|c: Vec<f32>| {
                    ModelError::Invalid(format!("expected 3 cutpoints, got {}", c.len()))
                })?;
                if !cutpoints.windows(2).all(|w| w[0] < w[1]) {
                    return Err(ModelError::Invalid(
                        "cutpoints must be strictly ascending".to_string(),
                    ));
                }
                Ok(TrainedModel::Cutpoints(CutpointModel {
                    version,
                    feature: index,
                    cutpoints,
                }))
            }
            ModelFile::Forest {
                version,
                feature_names,
                classes,
                trees,
            } => {
                let columns = feature_names
                    .iter()
                    .map(|name| {
                        FeatureVector::index_of(name)
                            .ok_or_else(|| unknown_feature(name))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if classes.is_empty() || classes.contains(&ActivityLabel::Unclassifiable) {
                    return Err(ModelError::Invalid(
                        "classes must list scored activity levels".to_string(),
                    ));
                }
                if trees.is_empty() {
                    return Err(ModelError::Invalid("forest has no trees".to_string()));
                }
                for (t, nodes) in trees.iter().enumerate() {
                    validate_tree(t, nodes, columns.len(), classes.len())?;
                }
                Ok(TrainedModel::Forest(ForestModel {
                    version,
                    columns,
                    classes,
                    trees,
                }))
            }
        }
    }
}

fn validate_tree(
    tree: usize,
    nodes: &[TreeNode],
    feature_count: usize,
    class_count: usize,
) -> Result<(), ModelError> {
    if nodes.is_empty() {
        return Err(ModelError::Invalid(format!("tree {} is empty", tree)));
    }
    for (i, node) in nodes.iter().enumerate() {
        let ok = match node {
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                *feature < feature_count
                    && threshold.is_finite()
                    && *left < nodes.len()
                    && *right < nodes.len()
            }
            TreeNode::Leaf { class } => *class < class_count,
        };
        if !ok {
            return Err(ModelError::Invalid(format!(
                "tree {} node {} refers outside the model",
                tree, i
            )));
        }
    }
    Ok(())
}

impl CutpointModel {
    fn score(&self, features: &FeatureVector) -> ActivityLabel {
        let value = features.values()[self.feature];
        let level = self.cutpoints.iter().take_while(|c| value >= **c).count();
        ActivityLabel::SCORED[level]
    }
}

impl ForestModel {
    fn predict_tree(&self, tree: usize, features: &FeatureVector) -> Result<usize, ClassifyError> {
        let nodes = &self.trees[tree];
        let mut node = 0usize;
        // Bounded walk, a cycle in the exported tree must not hang the run
        for _ in 0..=nodes.len() {
            match &nodes[node] {
                TreeNode::Leaf { class } => return Ok(*class),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = features.values()[self.columns[*feature]];
                    node = if value <= *threshold { *left } else { *right };
                }
            }
        }
        Err(ClassifyError::MalformedTree { tree, node })
    }

    /// Majority vote; ties go to the lower intensity.
    fn score(&self, features: &FeatureVector) -> Result<ActivityLabel, ClassifyError> {
        let mut votes = vec![0usize; self.classes.len()];
        for tree in 0..self.trees.len() {
            let class = self.predict_tree(tree, features)?;
            *votes
                .get_mut(class)
                .ok_or(ClassifyError::UnknownClass(class))? += 1;
        }

        let mut best: Option<(usize, ActivityLabel)> = None;
        for (class, &count) in votes.iter().enumerate() {
            let label = self.classes[class];
            best = match best {
                Some((best_count, best_label))
                    if best_count > count || (best_count == count && best_label <= label) =>
                {
                    Some((best_count, best_label))
                }
                _ => Some((count, label)),
            };
        }
        best.map(|(_, label)| label)
            .ok_or(ClassifyError::UnknownClass(0))
    }
}

impl Classifier for TrainedModel {
    fn version(&self) -> &str {
        match self {
            TrainedModel::Cutpoints(m) => &m.version,
            TrainedModel::Forest(m) => &m.version,
        }
    }

    fn score(&self, features: &FeatureVector) -> Result<ActivityLabel, ClassifyError> {
        features.check_finite()?;
        match self {
            TrainedModel::Cutpoints(m) => Ok(m.score(features)),
            TrainedModel::Forest(m) => m.score(features),
        }
    }
}

/// Names accepted in model files.
pub fn known_features() -> &'static [&'static str] {
    &FEATURE_NAMES
}

fn unknown_feature(name: &str) -> ModelError {
    ModelError::Invalid(format!(
        "unknown feature {}, expected one of {}",
        name,
        known_features().join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::FEATURE_COUNT;

    fn features(enmo_mean: f32, magnitude_std: f32) -> FeatureVector {
        let mut values = [0.0; FEATURE_COUNT];
        values[FeatureVector::index_of("enmo_mean").unwrap()] = enmo_mean;
        values[FeatureVector::index_of("magnitude_std").unwrap()] = magnitude_std;
        FeatureVector::from_values(values)
    }

    const CUTPOINTS: &str = r#"{
        "kind": "cutpoints",
        "version": "hildebrand-wrist-1",
        "feature": "enmo_mean",
        "cutpoints": [0.0458, 0.0932, 0.4183]
    }"#;

    const FOREST: &str = r#"{
        "kind": "forest",
        "version": "forest-2024-03",
        "feature_names": ["magnitude_std", "enmo_mean"],
        "classes": ["sedentary", "light", "moderate"],
        "trees": [
            [
                {"feature": 1, "threshold": 0.05, "left": 1, "right": 2},
                {"class": 0},
                {"feature": 0, "threshold": 0.2, "left": 3, "right": 4},
                {"class": 1},
                {"class": 2}
            ],
            [
                {"feature": 1, "threshold": 0.1, "left": 1, "right": 2},
                {"class": 0},
                {"class": 2}
            ],
            [
                {"class": 1}
            ]
        ]
    }"#;

    #[test]
    fn test_cutpoints_map_to_levels() {
        let model = TrainedModel::from_json(CUTPOINTS).unwrap();
        assert_eq!(model.version(), "hildebrand-wrist-1");
        assert_eq!(model.score(&features(0.01, 0.0)).unwrap(), ActivityLabel::Sedentary);
        assert_eq!(model.score(&features(0.05, 0.0)).unwrap(), ActivityLabel::Light);
        assert_eq!(model.score(&features(0.2, 0.0)).unwrap(), ActivityLabel::Moderate);
        assert_eq!(model.score(&features(0.9, 0.0)).unwrap(), ActivityLabel::Vigorous);
    }

    #[test]
    fn test_forest_majority_vote() {
        let model = TrainedModel::from_json(FOREST).unwrap();
        // Votes: sedentary, sedentary, light
        assert_eq!(model.score(&features(0.01, 0.0)).unwrap(), ActivityLabel::Sedentary);
        // Votes: moderate, moderate, light
        assert_eq!(model.score(&features(0.3, 0.5)).unwrap(), ActivityLabel::Moderate);
        // Votes: light, sedentary, light
        assert_eq!(model.score(&features(0.07, 0.1)).unwrap(), ActivityLabel::Light);
    }

    #[test]
    fn test_forest_tie_goes_to_lower_intensity() {
        let model = TrainedModel::from_json(
            r#"{"kind": "forest", "version": "tie", "feature_names": ["enmo_mean"],
                "classes": ["vigorous", "light"], "trees": [[{"class": 0}], [{"class": 1}]]}"#,
        )
        .unwrap();
        assert_eq!(model.score(&features(0.0, 0.0)).unwrap(), ActivityLabel::Light);
    }

    #[test]
    fn test_cyclic_tree_is_reported_not_looped() {
        let model = TrainedModel::from_json(
            r#"{"kind": "forest", "version": "cycle", "feature_names": ["enmo_mean"],
                "classes": ["light"],
                "trees": [[{"feature": 0, "threshold": 1.0, "left": 1, "right": 1},
                           {"feature": 0, "threshold": 1.0, "left": 0, "right": 0}]]}"#,
        )
        .unwrap();
        assert!(matches!(
            model.score(&features(0.0, 0.0)),
            Err(ClassifyError::MalformedTree { tree: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_feature_lists_accepted_names() {
        let forest = r#"{"kind": "forest", "version": "x", "feature_names": ["enmo_mean", "steps"],
            "classes": ["light"], "trees": [[{"class": 0}]]}"#;
        let message = TrainedModel::from_json(forest).unwrap_err().to_string();
        assert!(message.contains("unknown feature steps"), "{}", message);
        for name in known_features() {
            assert!(message.contains(name), "{} missing from {}", name, message);
        }
    }

    #[test]
    fn test_invalid_models_are_rejected() {
        let unknown_feature = r#"{"kind": "cutpoints", "version": "x", "feature": "steps", "cutpoints": [1, 2, 3]}"#;
        assert!(matches!(
            TrainedModel::from_json(unknown_feature),
            Err(ModelError::Invalid(_))
        ));

        let descending = r#"{"kind": "cutpoints", "version": "x", "feature": "enmo_mean", "cutpoints": [3, 2, 1]}"#;
        assert!(TrainedModel::from_json(descending).is_err());

        let dangling = r#"{"kind": "forest", "version": "x", "feature_names": ["enmo_mean"],
            "classes": ["light"], "trees": [[{"feature": 0, "threshold": 1.0, "left": 1, "right": 7}, {"class": 0}]]}"#;
        assert!(matches!(TrainedModel::from_json(dangling), Err(ModelError::Invalid(_))));

        assert!(matches!(TrainedModel::from_json("{"), Err(ModelError::Parse(_))));
    }

    #[test]
    fn test_non_finite_features_are_refused() {
        let model = TrainedModel::from_json(CUTPOINTS).unwrap();
        assert!(model.score(&features(f32::NAN, 0.0)).is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, FOREST).unwrap();
        let model = TrainedModel::load(&path).unwrap();
        assert_eq!(model.version(), "forest-2024-03");
        assert!(known_features().contains(&"enmo_mean"));
        assert!(matches!(
            TrainedModel::load(&dir.path().join("missing.json")),
            Err(ModelError::Io { .. })
        ));
    }
}
