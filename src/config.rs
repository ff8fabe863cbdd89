//! Model configuration, read from TOML.
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::LevelFilter;
use serde_derive::{Deserialize, Serialize};

/// The per-telescope convolutional backbones. Any other name is rejected when
/// the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CnnBlockKind {
    Alexnet,
    Mobilenet,
    Resnet,
}

impl FromStr for CnnBlockKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alexnet" => Ok(CnnBlockKind::Alexnet),
            "mobilenet" => Ok(CnnBlockKind::Mobilenet),
            "resnet" => Ok(CnnBlockKind::Resnet),
            other => bail!("no valid CNN block specified: {:?}", other),
        }
    }
}

impl fmt::Display for CnnBlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CnnBlockKind::Alexnet => "alexnet",
            CnnBlockKind::Mobilenet => "mobilenet",
            CnnBlockKind::Resnet => "resnet",
        };
        f.write_str(name)
    }
}

/// Where the per-event count of triggered telescopes comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceLengthSource {
    /// Count telescopes whose image is not entirely zero.
    Pixels,
    /// Sum the trigger flag input.
    Triggers,
}

impl Default for SequenceLengthSource {
    fn default() -> Self {
        SequenceLengthSource::Pixels
    }
}

fn default_lstm_size() -> u64 {
    2048
}

fn default_embedding_size() -> u64 {
    1024
}

fn default_fc_units() -> u64 {
    4096
}

fn default_dropout_rate() -> f32 {
    0.5
}

fn default_forget_bias() -> f32 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// (width, length, depth) of every telescope image
    pub image_shape: [u64; 3],
    pub num_telescopes: u64,
    /// width of the per-telescope position vector
    pub num_auxiliary_inputs: u64,
    pub num_gamma_hadron_classes: u64,
    pub cnn_block: CnnBlockKind,
    #[serde(default = "default_lstm_size")]
    pub lstm_size: u64,
    #[serde(default = "default_embedding_size")]
    pub embedding_size: u64,
    /// width of the two fully connected layers after max pooling
    #[serde(default = "default_fc_units")]
    pub fc_units: u64,
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f32,
    #[serde(default = "default_forget_bias")]
    pub forget_bias: f32,
    #[serde(default)]
    pub sequence_length_source: SequenceLengthSource,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ModelConfig {
    /// Parse and validate a configuration.
    pub fn from_toml_str(text: &str) -> Result<ModelConfig> {
        let config: ModelConfig = toml::from_str(text).context("parsing model configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ModelConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading model configuration {}", path.display()))?;
        ModelConfig::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.image_shape.iter().all(|d| *d > 0),
            "image_shape must be non-zero in every dimension, got {:?}",
            self.image_shape
        );
        ensure!(self.num_telescopes > 0, "num_telescopes must be at least 1");
        ensure!(
            self.num_gamma_hadron_classes >= 2,
            "num_gamma_hadron_classes must be at least 2, got {}",
            self.num_gamma_hadron_classes
        );
        ensure!(self.lstm_size > 0, "lstm_size must be at least 1");
        ensure!(self.embedding_size > 0, "embedding_size must be at least 1");
        ensure!(self.fc_units > 0, "fc_units must be at least 1");
        ensure!(
            (0.0..1.0).contains(&self.dropout_rate),
            "dropout_rate must be in [0, 1), got {}",
            self.dropout_rate
        );
        self.level_filter()?;
        Ok(())
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level).map_err(|_| anyhow!("unknown log_level {:?}", self.log_level))
    }

    /// Width of each telescope entry after the positions are appended.
    pub fn augmented_embedding_size(&self) -> u64 {
        self.embedding_size + self.num_auxiliary_inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
        image_shape = [2, 2, 1]
        num_telescopes = 3
        num_auxiliary_inputs = 3
        num_gamma_hadron_classes = 2
        cnn_block = "alexnet"
        lstm_size = 8
    "#;

    #[test]
    fn parses_with_defaults() {
        let config = ModelConfig::from_toml_str(SMALL).unwrap();
        assert_eq!(config.image_shape, [2, 2, 1]);
        assert_eq!(config.cnn_block, CnnBlockKind::Alexnet);
        assert_eq!(config.lstm_size, 8);
        assert_eq!(config.embedding_size, 1024);
        assert_eq!(config.fc_units, 4096);
        assert_eq!(config.sequence_length_source, SequenceLengthSource::Pixels);
        assert_eq!(config.augmented_embedding_size(), 1027);
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Info);
    }

    #[test]
    fn unknown_backbone_is_fatal() {
        let text = SMALL.replace("alexnet", "vgg");
        assert!(ModelConfig::from_toml_str(&text).is_err());
        assert!("vgg".parse::<CnnBlockKind>().is_err());
        assert_eq!("resnet".parse::<CnnBlockKind>().unwrap(), CnnBlockKind::Resnet);
    }

    #[test]
    fn rejects_degenerate_shapes() {
        let text = SMALL.replace("[2, 2, 1]", "[2, 0, 1]");
        assert!(ModelConfig::from_toml_str(&text).is_err());
        let text = SMALL.replace("num_telescopes = 3", "num_telescopes = 0");
        assert!(ModelConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn rejects_dropout_of_one() {
        let text = format!("{}\ndropout_rate = 1.0\n", SMALL);
        assert!(ModelConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn log_level_is_checked() {
        let text = format!("{}\nlog_level = \"DEBUG\"\n", SMALL);
        let config = ModelConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Debug);

        let text = format!("{}\nlog_level = \"chatty\"\n", SMALL);
        let err = ModelConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("chatty"));
    }
}
