use batchline::utils::load_model_config;
use batchline::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// The type of problem the model was trained on.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub enum ProblemType {
    #[serde(rename = "regression")]
    Regression,
    #[serde(rename = "single_label_classification")]
    SingleLabelClassification,
    #[serde(rename = "multi_label_classification")]
    MultiLabelClassification,
    #[default]
    None,
}

/// The task configuration of a model, read from its `config.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PretrainedConfig {
    /// The type of problem the model was trained on.
    #[serde(default)]
    problem_type: ProblemType,
    /// A map of the label ids to their corresponding labels.
    #[serde(default, deserialize_with = "deserialize_id2label")]
    id2label: Option<HashMap<usize, String>>,
    /// A map of the labels to their ids.
    #[serde(default)]
    label2id: Option<HashMap<String, usize>>,
}

impl PretrainedConfig {
    /// Loads the configuration from a `config.json` file.
    pub fn from_file(file: PathBuf) -> Result<Self> {
        let config = load_model_config(file)?;
        Ok(serde_json::from_value(config)?)
    }

    pub fn get_problem_type(&self) -> &ProblemType {
        &self.problem_type
    }

    pub fn get_id2label(&self) -> Option<&HashMap<usize, String>> {
        self.id2label.as_ref()
    }

    pub fn get_label2id(&self) -> Option<&HashMap<String, usize>> {
        self.label2id.as_ref()
    }

    /// Gets the number of labels the model was trained on.
    pub fn num_labels(&self) -> usize {
        self.id2label.as_ref().map_or(0, HashMap::len)
    }
}

fn deserialize_id2label<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<HashMap<usize, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let map: Option<HashMap<String, String>> = Deserialize::deserialize(deserializer)?;
    map.map(|m| {
        m.into_iter()
            .map(|(k, v)| {
                k.parse::<usize>()
                    .map(|id| (id, v))
                    .map_err(|_| serde::de::Error::custom(format!("invalid id2label key '{k}'")))
            })
            .collect::<std::result::Result<HashMap<usize, String>, D::Error>>()
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_id2label() {
        let config: PretrainedConfig = serde_json::from_str(
            r#"{
                "id2label": {"0": "O", "1": "B-PER", "2": "I-PER"},
                "label2id": {"O": 0, "B-PER": 1, "I-PER": 2},
                "problem_type": "single_label_classification"
            }"#,
        )
        .unwrap();
        let id2label = config.get_id2label().unwrap();
        assert_eq!(id2label.get(&1).map(String::as_str), Some("B-PER"));
        let label2id = config.get_label2id().unwrap();
        assert_eq!(label2id.get("I-PER"), Some(&2));
        assert_eq!(config.num_labels(), 3);
        assert_eq!(
            config.get_problem_type(),
            &ProblemType::SingleLabelClassification
        );
    }

    #[test]
    fn test_missing_id2label() {
        let config: PretrainedConfig = serde_json::from_str(r#"{"hidden_size": 768}"#).unwrap();
        assert!(config.get_id2label().is_none());
        assert_eq!(config.num_labels(), 0);
        assert_eq!(config.get_problem_type(), &ProblemType::None);
    }

    #[test]
    fn test_invalid_id2label_key() {
        let result = serde_json::from_str::<PretrainedConfig>(r#"{"id2label": {"first": "O"}}"#);
        assert!(result.is_err());
    }
}
