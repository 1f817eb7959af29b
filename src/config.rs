use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

/// How the input is padded to a multiple of the padder size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingMode {
    /// Pad with zeros.
    #[default]
    Zeros,
    /// Mirror the image without repeating the edge.
    Reflect,
}

/// Invalid [`CascadedGazeConfig`].
#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} has {len} levels, expected {levels}")]
    Levels {
        name: &'static str,
        len: usize,
        levels: usize,
    },
    #[error("gce_convs[{level}] is {value}, expected 2 or 3")]
    GceConvs { level: usize, value: usize },
    #[error("{name} must be positive")]
    Zero { name: &'static str },
    #[error("{name} is {value}, expected an even number")]
    Odd { name: &'static str, value: usize },
    #[error("drop_out_rate is {0}, expected [0, 1)")]
    DropOutRate(f32),
}

/// Hyperparameters of [`CascadedGaze`](crate::model::CascadedGaze).
///
/// The defaults are the published network. Missing fields take their default when deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadedGazeConfig {
    /// Image channels in and out.
    pub img_channel: usize,
    /// Channels after the intro convolution.
    pub width: usize,
    /// Number of blocks of each encoder level.
    pub enc_blk_nums: Vec<usize>,
    /// Number of blocks between the encoder and decoder.
    pub middle_blk_num: usize,
    /// Number of blocks of each decoder level, from the lowest resolution.
    pub dec_blk_nums: Vec<usize>,
    /// Global context extractor of each encoder level, 2 or 3 convolutions.
    pub gce_convs: Vec<usize>,
    /// Channel expansion of the depthwise branch.
    pub dw_expand: usize,
    /// Channel expansion of the feed forward branch.
    pub ffn_expand: usize,
    /// Dropout rate of every block.
    pub drop_out_rate: f32,
    /// Input padding.
    pub padding: PaddingMode,
}

impl Default for CascadedGazeConfig {
    fn default() -> Self {
        Self {
            img_channel: 3,
            width: 60,
            enc_blk_nums: vec![2, 2, 4, 6],
            middle_blk_num: 10,
            dec_blk_nums: vec![2, 2, 2, 2],
            gce_convs: vec![3, 3, 2, 2],
            dw_expand: 2,
            ffn_expand: 2,
            drop_out_rate: 0.,
            padding: PaddingMode::Zeros,
        }
    }
}

impl CascadedGazeConfig {
    /// The number of encoder / decoder levels.
    pub fn levels(&self) -> usize {
        self.enc_blk_nums.len()
    }
    /// Inputs are padded to a multiple of `2^levels`.
    pub fn padder_size(&self) -> usize {
        1 << self.levels()
    }
    /// Checks the config.
    ///
    /// **Errors**
    ///
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let levels = self.levels();
        for (name, len) in [
            ("dec_blk_nums", self.dec_blk_nums.len()),
            ("gce_convs", self.gce_convs.len()),
        ] {
            if len != levels {
                return Err(ConfigError::Levels { name, len, levels });
            }
        }
        if let Some((level, value)) = self
            .gce_convs
            .iter()
            .copied()
            .enumerate()
            .find(|(_, x)| !matches!(x, 2 | 3))
        {
            return Err(ConfigError::GceConvs { level, value });
        }
        for (name, value) in [
            ("img_channel", self.img_channel),
            ("width", self.width),
            ("dw_expand", self.dw_expand),
            ("ffn_expand", self.ffn_expand),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        for (name, value) in [("dw_expand", self.dw_expand), ("ffn_expand", self.ffn_expand)] {
            if value % 2 != 0 {
                return Err(ConfigError::Odd { name, value });
            }
        }
        if !(0. ..1.).contains(&self.drop_out_rate) {
            return Err(ConfigError::DropOutRate(self.drop_out_rate));
        }
        Ok(())
    }
    /// Reads a json config.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        log::debug!("read config {path:?}");
        Ok(config)
    }
    /// Writes the config as json.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        log::debug!("wrote config {path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = CascadedGazeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.padder_size(), 16);
    }

    #[test]
    fn validate_errors() {
        let config = CascadedGazeConfig {
            gce_convs: vec![3, 3, 2],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Levels {
                name: "gce_convs",
                len: 3,
                levels: 4
            })
        );
        let config = CascadedGazeConfig {
            gce_convs: vec![3, 4, 2, 2],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::GceConvs { level: 1, value: 4 })
        );
        let config = CascadedGazeConfig {
            dw_expand: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Odd { .. })));
        let config = CascadedGazeConfig {
            width: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { name: "width" }));
        let config = CascadedGazeConfig {
            drop_out_rate: 1.,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_defaults_and_round_trip() {
        let config: CascadedGazeConfig =
            serde_json::from_str(r#"{ "width": 8, "padding": "reflect" }"#).unwrap();
        assert_eq!(config.width, 8);
        assert_eq!(config.padding, PaddingMode::Reflect);
        assert_eq!(config.enc_blk_nums, [2, 2, 4, 6]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        config.to_json_file(&path).unwrap();
        assert_eq!(CascadedGazeConfig::from_json_file(&path).unwrap(), config);
        fs::write(&path, r#"{ "gce_convs": [1] }"#).unwrap();
        assert!(CascadedGazeConfig::from_json_file(&path).is_err());
    }
}
